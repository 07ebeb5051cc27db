//! Outbox reconciler: replays queued mutations once connectivity returns.
//!
//! One drain cycle reads the whole outbox in enqueue order and replays each
//! operation once. Successful rows are removed, failed rows stay for the next
//! trigger, and operations depending on a failed or held one are held too.

mod overlay;
mod replay;
mod retry;

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::error::{Result, SyncError};
use crate::http::{Request, Response, Transport};
use crate::model::{is_local_id, CachedEntity, EntryFields, MutationPayload, PendingOperation};
use crate::router::{ResponseSource, Router};
use crate::store::LocalStore;

pub use overlay::{optimistic_entity, outbox_image_ref, overlay_pending, strip_pending};
pub use replay::{build_request, parse_entry_list, rewrite_url};
pub use retry::RetryPolicy;

/// What started a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
  /// Connectivity came back; retries everything queued
  Reconnect,
  /// Platform background-sync wake event; skips operations not yet due
  Wake,
  /// The application asked for an immediate retry
  Manual,
}

/// Observable reconciler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
  Idle,
  Draining,
  Success,
  Partial,
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  /// Outbox was empty, nothing sent
  Idle,
  /// Every operation replayed
  Success,
  /// Some operations remain queued
  Partial,
  /// Another drain was already running
  AlreadyDraining,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
  pub outcome: DrainOutcome,
  pub replayed: Vec<i64>,
  pub failed: Vec<i64>,
  pub held: Vec<i64>,
  pub dead_lettered: Vec<i64>,
  /// Whether the local store was refreshed from the server afterwards
  pub refreshed: bool,
}

/// How one operation fared within a cycle.
enum Step {
  Replayed,
  Held,
  Failed,
  DeadLettered,
}

impl DrainReport {
  fn new(outcome: DrainOutcome) -> Self {
    Self {
      outcome,
      replayed: Vec::new(),
      failed: Vec::new(),
      held: Vec::new(),
      dead_lettered: Vec::new(),
      refreshed: false,
    }
  }
}

pub struct Reconciler {
  store: Arc<dyn LocalStore>,
  transport: Arc<dyn Transport>,
  router: Arc<Router>,
  api: ApiConfig,
  policy: RetryPolicy,
  timeout: Duration,
  drain_lock: Mutex<()>,
  state: watch::Sender<DrainState>,
}

impl Reconciler {
  pub fn new(
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn Transport>,
    router: Arc<Router>,
    api: ApiConfig,
    policy: RetryPolicy,
    timeout: Duration,
  ) -> Self {
    let (state, _) = watch::channel(DrainState::Idle);
    Self {
      store,
      transport,
      router,
      api,
      policy,
      timeout,
      drain_lock: Mutex::new(()),
      state,
    }
  }

  pub fn state(&self) -> DrainState {
    *self.state.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<DrainState> {
    self.state.subscribe()
  }

  /// Run one drain cycle.
  pub async fn drain(&self, trigger: DrainTrigger) -> Result<DrainReport> {
    let Ok(_guard) = self.drain_lock.try_lock() else {
      debug!(?trigger, "drain already running");
      return Ok(DrainReport::new(DrainOutcome::AlreadyDraining));
    };

    let ops = self.store.list_pending_operations()?;
    if ops.is_empty() {
      self.state.send_replace(DrainState::Idle);
      return Ok(DrainReport::new(DrainOutcome::Idle));
    }

    self.state.send_replace(DrainState::Draining);
    info!(?trigger, pending = ops.len(), "draining outbox");

    let mut report = DrainReport::new(DrainOutcome::Success);
    let now = Utc::now();
    // Targets of failed or held operations; later operations on them wait.
    let mut blocked: HashSet<String> = HashSet::new();
    // Local ids whose create is still in the outbox.
    let mut queued_creates: HashSet<String> = ops
      .iter()
      .filter_map(|op| match &op.payload {
        MutationPayload::Create { local_id, .. } => Some(local_id.clone()),
        _ => None,
      })
      .collect();

    for op in &ops {
      let target = op.target_id().to_string();

      if blocked.contains(&target) {
        debug!(op_id = op.id, target = %target, "holding operation behind earlier one");
        report.held.push(op.id);
        continue;
      }

      if trigger == DrainTrigger::Wake && !self.is_due(op, now) {
        report.held.push(op.id);
        blocked.insert(target);
        continue;
      }

      let step = match self.replay_one(op, &mut queued_creates).await {
        Ok(step) => step,
        Err(e) => {
          warn!(op_id = op.id, error = %e, "store error while replaying, skipping operation");
          Step::Failed
        }
      };
      match step {
        Step::Replayed => {
          debug!(op_id = op.id, kind = op.kind().as_str(), "operation replayed");
          report.replayed.push(op.id);
        }
        Step::Held => {
          debug!(op_id = op.id, target = %target, "target not yet known to server");
          report.held.push(op.id);
          blocked.insert(target);
        }
        Step::Failed => {
          report.failed.push(op.id);
          blocked.insert(target);
        }
        Step::DeadLettered => {
          report.dead_lettered.push(op.id);
          blocked.insert(target);
        }
      }
    }

    let all_done =
      report.failed.is_empty() && report.held.is_empty() && report.dead_lettered.is_empty();
    if all_done {
      report.outcome = DrainOutcome::Success;
      match refresh_from_server(self.store.as_ref(), &self.router, &self.api, true).await {
        Ok(_) => report.refreshed = true,
        Err(e) => {
          warn!(error = %e, "post-drain refresh failed");
          self.rebuild_local_view();
        }
      }
      self.state.send_replace(DrainState::Success);
    } else {
      report.outcome = DrainOutcome::Partial;
      self.rebuild_local_view();
      self.state.send_replace(DrainState::Partial);
    }

    info!(
      outcome = ?report.outcome,
      replayed = report.replayed.len(),
      failed = report.failed.len(),
      held = report.held.len(),
      dead_lettered = report.dead_lettered.len(),
      "drain finished"
    );
    Ok(report)
  }

  /// Replay a single operation. Errors are store failures; network and
  /// server failures are counted and reported as `Step::Failed`.
  async fn replay_one(
    &self,
    op: &PendingOperation,
    queued_creates: &mut HashSet<String>,
  ) -> Result<Step> {
    let (url, payload) = match self.resolve_target(op)? {
      Some(resolved) => resolved,
      None if queued_creates.contains(op.target_id()) => return Ok(Step::Held),
      None => {
        // The create left the outbox without yielding a server id.
        let reason = format!("entry {} was never created on the server", op.target_id());
        warn!(op_id = op.id, reason = %reason, "abandoning operation");
        self.store.dead_letter(op.id, &reason)?;
        return Ok(Step::DeadLettered);
      }
    };

    match self.replay(&url, &payload).await {
      Ok(response) => {
        if let Err(e) = self.store.remove_pending_operation(op.id) {
          warn!(op_id = op.id, error = %e, "replayed but could not remove outbox row");
        }
        self.settle_entity(op, &payload, &response).await;
        if let MutationPayload::Create { local_id, .. } = &payload {
          queued_creates.remove(local_id);
        }
        Ok(Step::Replayed)
      }
      Err(e) => {
        if self.record_failure(op, &e)? {
          Ok(Step::DeadLettered)
        } else {
          Ok(Step::Failed)
        }
      }
    }
  }

  fn is_due(&self, op: &PendingOperation, now: chrono::DateTime<Utc>) -> bool {
    match self.store.attempt_state(op.id) {
      Ok(Some(state)) => state.next_attempt_at <= now,
      Ok(None) => true,
      Err(e) => {
        warn!(op_id = op.id, error = %e, "could not read attempt state");
        true
      }
    }
  }

  /// URL and payload to replay, with local ids swapped for server ids.
  /// None when the target only exists locally so far.
  fn resolve_target(&self, op: &PendingOperation) -> Result<Option<(String, MutationPayload)>> {
    let target = op.target_id();
    if matches!(op.payload, MutationPayload::Create { .. }) || !is_local_id(target) {
      return Ok(Some((op.target_url.clone(), op.payload.clone())));
    }

    Ok(self.store.resolve_id(target)?.map(|server_id| {
      (
        rewrite_url(&op.target_url, target, &server_id),
        op.payload.retarget(&server_id),
      )
    }))
  }

  async fn replay(&self, url: &str, payload: &MutationPayload) -> Result<Response> {
    let request = build_request(url, payload)?;
    let response = match tokio::time::timeout(self.timeout, self.transport.send(&request)).await {
      Ok(result) => result?,
      Err(_) => {
        return Err(SyncError::NetworkUnreachable(format!(
          "{} timed out after {:?}",
          request.url, self.timeout
        )))
      }
    };
    response.error_for_status(&request)
  }

  /// Count the failure; returns true when the operation got dead-lettered.
  fn record_failure(&self, op: &PendingOperation, error: &SyncError) -> Result<bool> {
    let prior = self
      .store
      .attempt_state(op.id)?
      .map(|s| s.attempts)
      .unwrap_or(0);
    let next = self.policy.next_attempt_at(prior + 1, Utc::now());
    let attempts = self.store.record_failure(op.id, &error.to_string(), next)?;

    if self.policy.should_dead_letter(attempts, error) {
      warn!(op_id = op.id, attempts, error = %error, "abandoning operation");
      self.store.dead_letter(op.id, &error.to_string())?;
      return Ok(true);
    }

    debug!(op_id = op.id, attempts, error = %error, "operation failed, left queued");
    Ok(false)
  }

  /// Reflect a successful replay in the local store. Best effort.
  async fn settle_entity(
    &self,
    op: &PendingOperation,
    payload: &MutationPayload,
    response: &Response,
  ) {
    let result = match payload {
      MutationPayload::Create { local_id, fields, .. } => match response.json::<CachedEntity>() {
        Ok(server_entity) => self.adopt_created(local_id, &server_entity),
        Err(e) => {
          debug!(op_id = op.id, error = %e, "create response carried no entity, looking it up");
          match self.recover_created(local_id, fields).await {
            Ok(true) => Ok(()),
            Ok(false) => {
              warn!(op_id = op.id, local_id = %local_id, "created entry not found on the server");
              Ok(())
            }
            Err(e) => Err(e),
          }
        }
      },
      MutationPayload::Delete { id } => self
        .store
        .remove_entity(id)
        .and_then(|_| self.store.remove_entity(op.target_id())),
      MutationPayload::SetVisibility { id, public } => match self.store.get_entity(id) {
        Ok(Some(mut entity)) => {
          entity.public = *public;
          entity.server_public = None;
          self.store.upsert_entity(&entity)
        }
        Ok(None) => Ok(()),
        Err(e) => Err(e),
      },
    };

    if let Err(e) = result {
      warn!(op_id = op.id, error = %e, "could not update local copy after replay");
    }
  }

  fn adopt_created(&self, local_id: &str, server_entity: &CachedEntity) -> Result<()> {
    self.store.record_remap(local_id, &server_entity.id)?;
    self.store.remove_entity(local_id)?;
    self.store.upsert_entity(server_entity)
  }

  /// Find a just-created entry in the server's list by its creation time and
  /// text. The newest match wins. Returns false when nothing matches.
  async fn recover_created(&self, local_id: &str, fields: &EntryFields) -> Result<bool> {
    let request = Request::get(&self.api.entries_url())?;
    let routed = self.router.handle(request).await?;
    if routed.source != ResponseSource::Network {
      return Ok(false);
    }

    let found = parse_entry_list(&routed.response)?
      .into_iter()
      .filter(|e| e.created_at == fields.created_at && e.text_content == fields.text_entry)
      .max_by_key(|e| e.id.parse::<i64>().unwrap_or(0));
    match found {
      Some(entity) => {
        self.adopt_created(local_id, &entity)?;
        debug!(local_id = %local_id, server_id = %entity.id, "recovered server id");
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Recompute pending markers from whatever is still queued.
  fn rebuild_local_view(&self) {
    if let Err(e) = rebuild_local_view(self.store.as_ref()) {
      warn!(error = %e, "could not rebuild local view");
    }
  }
}

/// Remaps for every local id the queued operations still mention.
pub fn remaps_for(store: &dyn LocalStore, ops: &[PendingOperation]) -> Result<HashMap<String, String>> {
  let mut remaps = HashMap::new();
  for op in ops {
    let target = op.target_id();
    if is_local_id(target) && !remaps.contains_key(target) {
      if let Some(server_id) = store.resolve_id(target)? {
        remaps.insert(target.to_string(), server_id);
      }
    }
  }
  Ok(remaps)
}

/// Re-derive the local entity table: drop stale markers, overlay the outbox.
pub fn rebuild_local_view(store: &dyn LocalStore) -> Result<Vec<CachedEntity>> {
  let ops = store.list_pending_operations()?;
  let remaps = remaps_for(store, &ops)?;
  let entities = overlay_pending(strip_pending(store.list_entities()?), &ops, &remaps);
  store.replace_all_entities(&entities)?;
  Ok(entities)
}

/// Fetch the authoritative entry list through the router and mirror it locally,
/// with still-queued mutations overlaid.
///
/// With `require_fresh`, a response served from cache is refused so a stale
/// list never overwrites newer local state.
pub async fn refresh_from_server(
  store: &dyn LocalStore,
  router: &Router,
  api: &ApiConfig,
  require_fresh: bool,
) -> Result<Vec<CachedEntity>> {
  let request = Request::get(&api.entries_url())?;
  let routed = router.handle(request).await?;
  if require_fresh && routed.source != ResponseSource::Network {
    return Err(SyncError::NetworkUnreachable(
      "entry list only available from cache".to_string(),
    ));
  }

  let server = parse_entry_list(&routed.response)?;
  let ops = store.list_pending_operations()?;
  let remaps = remaps_for(store, &ops)?;
  let entities = overlay_pending(server, &ops, &remaps);
  store.replace_all_entities(&entities)?;
  debug!(count = entities.len(), source = ?routed.source, "refreshed local entities");
  Ok(entities)
}
