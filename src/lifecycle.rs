//! Version lifecycle: install a new cache generation, wait or skip waiting,
//! then activate it and tell every connected consumer.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{PartitionName, PrecacheReport, Purpose, ResponseCache};
use crate::config::NetworkConfig;
use crate::error::Result;
use crate::http::Transport;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Nothing installed yet
  Idle,
  Installing,
  /// Installed, waiting for consumers on the old version to go away
  Waiting,
  Activating,
  Active,
}

/// Message sent by a consumer to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ConsumerMessage {
  ActivateNow,
}

/// Message broadcast by the controller to every consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControllerMessage {
  VersionUpdated { version: String },
}

/// What an activation did.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
  pub version: String,
  pub evicted: Vec<String>,
}

struct Inner {
  state: LifecycleState,
  active: Option<String>,
  waiting: Option<String>,
  /// An activate-now arrived while this install was in progress
  skip_requested: bool,
}

pub struct Lifecycle {
  cache: Arc<ResponseCache>,
  inner: Mutex<Inner>,
  /// Configured policy: never wait for consumers
  always_skip_waiting: bool,
  fetch_timeout: Duration,
  version: watch::Sender<String>,
  updates: broadcast::Sender<ControllerMessage>,
}

impl Lifecycle {
  /// Controller for a process that wants `current` installed.
  ///
  /// The active version is recovered from the partitions already in the
  /// cache: `current` if present, otherwise the newest other generation by
  /// [`compare_versions`].
  /// Routing keeps using the active version until `current` activates.
  pub fn new(cache: Arc<ResponseCache>, current: &str, skip_waiting: bool) -> Self {
    let versions: BTreeSet<String> = match cache.partition_names() {
      Ok(names) => names
        .iter()
        .filter_map(|n| PartitionName::parse(n))
        .map(|p| p.version)
        .collect(),
      Err(e) => {
        warn!(error = %e, "could not list cache partitions");
        BTreeSet::new()
      }
    };
    let active = if versions.contains(current) {
      Some(current.to_string())
    } else {
      versions.into_iter().max_by(|a, b| compare_versions(a, b))
    };
    let state = if active.is_some() {
      LifecycleState::Active
    } else {
      LifecycleState::Idle
    };
    let (version, _) = watch::channel(active.clone().unwrap_or_else(|| current.to_string()));
    let (updates, _) = broadcast::channel(16);

    Self {
      cache,
      inner: Mutex::new(Inner {
        state,
        active,
        waiting: None,
        skip_requested: false,
      }),
      always_skip_waiting: skip_waiting,
      fetch_timeout: NetworkConfig::default().timeout(),
      version,
      updates,
    }
  }

  /// Per-URL timeout for precache fetches.
  pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
    self.fetch_timeout = timeout;
    self
  }

  fn inner(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn state(&self) -> LifecycleState {
    self.inner().state
  }

  pub fn active_version(&self) -> Option<String> {
    self.inner().active.clone()
  }

  pub fn waiting_version(&self) -> Option<String> {
    self.inner().waiting.clone()
  }

  /// Whether an installed version is waiting to take over.
  pub fn has_waiting_update(&self) -> bool {
    self.inner().waiting.is_some()
  }

  /// Version the router should use for partition lookups.
  pub fn version_receiver(&self) -> watch::Receiver<String> {
    self.version.subscribe()
  }

  /// Attach a consumer. Dropping the receiver disconnects it.
  pub fn connect(&self) -> broadcast::Receiver<ControllerMessage> {
    self.updates.subscribe()
  }

  pub fn consumer_count(&self) -> usize {
    self.updates.receiver_count()
  }

  /// Install `version`: precache the shell, then activate right away if
  /// allowed, otherwise wait.
  pub async fn install(
    &self,
    version: &str,
    transport: &dyn Transport,
    precache: &[String],
  ) -> Result<PrecacheReport> {
    {
      let mut inner = self.inner();
      if inner.active.as_deref() == Some(version) {
        debug!(version, "version already active");
        return Ok(PrecacheReport::default());
      }
      inner.state = LifecycleState::Installing;
      inner.skip_requested = false;
    }
    info!(version, "installing");

    let report = self
      .cache
      .precache(
        transport,
        Purpose::StaticShell,
        version,
        precache,
        self.fetch_timeout,
      )
      .await?;

    let (first_install, skip_requested) = {
      let mut inner = self.inner();
      inner.state = LifecycleState::Waiting;
      inner.waiting = Some(version.to_string());
      (inner.active.is_none(), inner.skip_requested)
    };

    if first_install
      || self.always_skip_waiting
      || skip_requested
      || self.consumer_count() == 0
    {
      self.activate();
    } else {
      info!(version, consumers = self.consumer_count(), "waiting for consumers to close");
    }
    Ok(report)
  }

  /// Honor a skip-waiting signal: activate the waiting version now.
  ///
  /// A signal during an install applies to that install once it finishes.
  /// With nothing installing or waiting the signal is dropped.
  pub fn skip_waiting(&self) -> Option<Activation> {
    {
      let mut inner = self.inner();
      if inner.state == LifecycleState::Installing {
        inner.skip_requested = true;
        return None;
      }
      if inner.waiting.is_none() {
        debug!("activate-now with nothing waiting, ignored");
        return None;
      }
    }
    self.activate()
  }

  pub fn handle_message(&self, message: ConsumerMessage) -> Option<Activation> {
    match message {
      ConsumerMessage::ActivateNow => self.skip_waiting(),
    }
  }

  /// Parse and handle a raw JSON consumer message.
  pub fn handle_raw(&self, raw: &str) -> Result<Option<Activation>> {
    let message: ConsumerMessage = serde_json::from_str(raw)?;
    Ok(self.handle_message(message))
  }

  /// Activate the waiting version once no consumer is left on the old one.
  pub fn poll_waiting(&self) -> Option<Activation> {
    if self.has_waiting_update() && self.consumer_count() == 0 {
      self.activate()
    } else {
      None
    }
  }

  /// Promote the waiting version. Cache maintenance here is best effort.
  pub fn activate(&self) -> Option<Activation> {
    let version = {
      let mut inner = self.inner();
      let version = inner.waiting.take()?;
      inner.state = LifecycleState::Activating;
      inner.skip_requested = false;
      version
    };

    let current = PartitionName::all_for(&version);
    let evicted = match self.cache.evict_stale_partitions(&current) {
      Ok(evicted) => evicted,
      Err(e) => {
        warn!(error = %e, "stale partition eviction failed");
        Vec::new()
      }
    };
    for purpose in Purpose::ALL {
      if let Err(e) = self.cache.ensure_partition(purpose, &version) {
        warn!(partition = %PartitionName::new(purpose, version.as_str()), error = %e, "could not create partition");
      }
    }

    self.version.send_replace(version.clone());
    {
      let mut inner = self.inner();
      inner.state = LifecycleState::Active;
      inner.active = Some(version.clone());
    }

    let notified = self
      .updates
      .send(ControllerMessage::VersionUpdated {
        version: version.clone(),
      })
      .unwrap_or(0);
    info!(version = %version, evicted = evicted.len(), notified, "activated");

    Some(Activation { version, evicted })
  }
}

/// Order version labels so numeric runs compare by value: `v9 < v10`,
/// `1.2.9 < 1.2.10`. Everything else compares bytewise.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
  let mut left = chunks(a);
  let mut right = chunks(b);
  loop {
    match (left.next(), right.next()) {
      (None, None) => return a.cmp(b),
      (None, Some(_)) => return Ordering::Less,
      (Some(_), None) => return Ordering::Greater,
      (Some(x), Some(y)) => {
        let order = match (is_numeric(x), is_numeric(y)) {
          (true, true) => {
            let (x, y) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
            x.len().cmp(&y.len()).then_with(|| x.cmp(y))
          }
          _ => x.cmp(y),
        };
        if order != Ordering::Equal {
          return order;
        }
      }
    }
  }
}

/// Split into maximal runs of digits and non-digits.
fn chunks(s: &str) -> impl Iterator<Item = &str> {
  let mut rest = s;
  std::iter::from_fn(move || {
    let first = rest.chars().next()?;
    let digit = first.is_ascii_digit();
    let end = rest
      .find(|c: char| c.is_ascii_digit() != digit)
      .unwrap_or(rest.len());
    let (chunk, tail) = rest.split_at(end);
    rest = tail;
    Some(chunk)
  })
}

fn is_numeric(chunk: &str) -> bool {
  chunk.bytes().all(|b| b.is_ascii_digit())
}

/// Resolve configured precache paths against the app origin.
///
/// Absolute URLs pass through; relative ones are dropped when no origin is set.
pub fn resolve_precache_urls(origin: Option<&str>, paths: &[String]) -> Vec<String> {
  let base = origin.and_then(|o| Url::parse(o).ok());
  paths
    .iter()
    .filter_map(|path| {
      if let Ok(url) = Url::parse(path) {
        return Some(url.to_string());
      }
      match &base {
        Some(base) => base.join(path).ok().map(|u| u.to_string()),
        None => {
          debug!(path = %path, "no origin configured, skipping precache path");
          None
        }
      }
    })
    .collect()
}
