//! `SyncEngine`: the one object owning the store, cache, router, reconciler
//! and lifecycle controller for a background context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::http::{Request, Response, Transport};
use crate::lifecycle::{resolve_precache_urls, Lifecycle};
use crate::model::{
  is_local_id, now_iso, CachedEntity, DeadLetter, EntryFields, LocalIds, MutationPayload,
  NewEntry, NewOperation, PendingOperation,
};
use crate::router::{RoutedResponse, Router};
use crate::store::{open_or_degraded, LocalStore};
use crate::sync::{
  build_request, rebuild_local_view, refresh_from_server, rewrite_url, DrainReport, DrainTrigger,
  Reconciler, RetryPolicy,
};

const STORE_FILE: &str = "store.db";
const CACHE_FILE: &str = "cache.db";

/// Result of a user-initiated mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// Applied on the server; the local store has been refreshed
  Synced,
  /// Saved to the outbox with an optimistic local copy
  Queued {
    op_id: i64,
    entity_id: String,
    reason: String,
  },
}

impl MutationOutcome {
  pub fn is_queued(&self) -> bool {
    matches!(self, MutationOutcome::Queued { .. })
  }
}

pub struct SyncEngine {
  config: Config,
  store: Arc<dyn LocalStore>,
  transport: Arc<dyn Transport>,
  router: Arc<Router>,
  reconciler: Reconciler,
  lifecycle: Lifecycle,
  local_ids: LocalIds,
  online: AtomicBool,
}

impl SyncEngine {
  /// Open storage under the configured data directory and install the
  /// configured cache version.
  ///
  /// A store that cannot be opened degrades to offline-incapable mode; a
  /// cache that cannot be opened falls back to memory.
  pub async fn initialize(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
    let data_dir = config
      .storage
      .resolve_data_dir()
      .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;

    let store = open_or_degraded(&data_dir.join(STORE_FILE));
    let cache = match ResponseCache::open(&data_dir.join(CACHE_FILE)) {
      Ok(cache) => cache,
      Err(e) => {
        warn!(error = %e, "response cache unavailable, using memory");
        ResponseCache::open_in_memory()?
      }
    };

    Ok(Self::with_storage(config, transport, store, Arc::new(cache)).await)
  }

  /// Build an engine over already-open storage and run the install step.
  pub async fn with_storage(
    config: Config,
    transport: Arc<dyn Transport>,
    store: Arc<dyn LocalStore>,
    cache: Arc<ResponseCache>,
  ) -> Self {
    let lifecycle = Lifecycle::new(
      cache.clone(),
      &config.cache.version,
      config.lifecycle.skip_waiting,
    )
    .with_fetch_timeout(config.network.timeout());
    let router = Arc::new(Router::new(
      cache,
      transport.clone(),
      config.routing.clone(),
      lifecycle.version_receiver(),
      config.network.timeout(),
    ));
    let reconciler = Reconciler::new(
      store.clone(),
      transport.clone(),
      router.clone(),
      config.api.clone(),
      RetryPolicy::from_config(&config.sync),
      config.network.timeout(),
    );

    let engine = Self {
      config,
      store,
      transport,
      router,
      reconciler,
      lifecycle,
      local_ids: LocalIds::new(),
      online: AtomicBool::new(true),
    };
    engine.install().await;
    engine
  }

  async fn install(&self) {
    let urls = resolve_precache_urls(
      self.config.api.origin.as_deref(),
      &self.config.cache.precache,
    );
    if let Err(e) = self
      .lifecycle
      .install(&self.config.cache.version, self.transport.as_ref(), &urls)
      .await
    {
      warn!(error = %e, "install failed");
    }
  }

  /// Wait for background cache refreshes to finish.
  pub async fn shutdown(&self) {
    self.router.settle().await;
    info!("sync engine stopped");
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn lifecycle(&self) -> &Lifecycle {
    &self.lifecycle
  }

  pub fn reconciler(&self) -> &Reconciler {
    &self.reconciler
  }

  /// False when running on the degraded store.
  pub fn is_storage_available(&self) -> bool {
    self.store.is_available()
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  pub fn set_online(&self, online: bool) {
    let was = self.online.swap(online, Ordering::SeqCst);
    if was != online {
      info!(online, "connectivity changed");
    }
  }

  /// Connectivity returned: drain the outbox.
  pub async fn on_reconnect(&self) -> Result<DrainReport> {
    self.set_online(true);
    self.reconciler.drain(DrainTrigger::Reconnect).await
  }

  /// Platform wake event. Only our sync tag triggers a drain.
  pub async fn on_wake(&self, tag: &str) -> Result<Option<DrainReport>> {
    if tag != self.config.sync.tag {
      debug!(tag, "ignoring wake event for foreign tag");
      return Ok(None);
    }
    self.reconciler.drain(DrainTrigger::Wake).await.map(Some)
  }

  /// Drain now, ignoring backoff schedules.
  pub async fn retry_now(&self) -> Result<DrainReport> {
    self.reconciler.drain(DrainTrigger::Manual).await
  }

  /// Route an arbitrary request through the caching strategies.
  pub async fn fetch(&self, request: Request) -> Result<RoutedResponse> {
    self.router.handle(request).await
  }

  /// Pull the entry list and mirror it locally, newest first.
  pub async fn refresh_entries(&self) -> Result<Vec<CachedEntity>> {
    let mut entities =
      refresh_from_server(self.store.as_ref(), &self.router, &self.config.api, false).await?;
    sort_newest_first(&mut entities);
    Ok(entities)
  }

  /// Locally mirrored entries, newest first.
  pub fn entries(&self) -> Result<Vec<CachedEntity>> {
    let mut entities = self.store.list_entities()?;
    sort_newest_first(&mut entities);
    Ok(entities)
  }

  pub fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
    self.store.list_pending_operations()
  }

  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    self.store.list_dead_letters()
  }

  pub async fn create_entry(&self, entry: NewEntry) -> Result<MutationOutcome> {
    let payload = MutationPayload::Create {
      local_id: self.local_ids.next(),
      fields: EntryFields {
        text_entry: entry.text,
        username: self.config.api.username.clone(),
        created_at: now_iso(),
        public_status: entry.public,
      },
      attachment: entry.attachment,
    };
    self.submit(self.config.api.create_url(), payload).await
  }

  pub async fn delete_entry(&self, id: &str) -> Result<MutationOutcome> {
    let payload = MutationPayload::Delete { id: id.to_string() };
    self.submit(self.config.api.entry_url(id), payload).await
  }

  pub async fn set_visibility(&self, id: &str, public: bool) -> Result<MutationOutcome> {
    let payload = MutationPayload::SetVisibility {
      id: id.to_string(),
      public,
    };
    self.submit(self.config.api.visibility_url(id), payload).await
  }

  /// Send a mutation now if possible, otherwise queue it.
  ///
  /// Mutations on an entity that still has queued operations are queued
  /// behind them so the server sees them in order.
  async fn submit(&self, target_url: String, payload: MutationPayload) -> Result<MutationOutcome> {
    let target = payload.target_id().to_string();

    if !self.is_online() {
      return self.enqueue(target_url, payload, "offline".to_string());
    }
    if self.has_queued_work_for(&target)? {
      return self.enqueue(target_url, payload, "earlier changes still queued".to_string());
    }

    let (url, live) = if !matches!(payload, MutationPayload::Create { .. }) && is_local_id(&target) {
      match self.store.resolve_id(&target)? {
        Some(server_id) => (
          rewrite_url(&target_url, &target, &server_id),
          payload.retarget(&server_id),
        ),
        None => return self.enqueue(target_url, payload, "entry not yet synced".to_string()),
      }
    } else {
      (target_url.clone(), payload.clone())
    };

    let request = build_request(&url, &live)?;
    let sent = match self.router.handle(request.clone()).await {
      Ok(routed) => routed.response.error_for_status(&request),
      Err(e) => Err(e),
    };

    match sent {
      Ok(response) => {
        self.apply_synced(&live, &response);
        if let Err(e) =
          refresh_from_server(self.store.as_ref(), &self.router, &self.config.api, true).await
        {
          warn!(error = %e, "refresh after mutation failed");
        }
        Ok(MutationOutcome::Synced)
      }
      Err(e) if e.is_offline() => {
        self.set_online(false);
        self.enqueue(target_url, payload, e.to_string())
      }
      Err(e) => Err(e),
    }
  }

  fn has_queued_work_for(&self, target: &str) -> Result<bool> {
    Ok(self
      .store
      .list_pending_operations()?
      .iter()
      .any(|op| op.target_id() == target))
  }

  fn enqueue(
    &self,
    target_url: String,
    payload: MutationPayload,
    reason: String,
  ) -> Result<MutationOutcome> {
    let entity_id = payload.target_id().to_string();
    let kind = payload.kind();
    let op_id = self.store.enqueue_operation(&NewOperation {
      target_url,
      payload,
    })?;

    if let Err(e) = rebuild_local_view(self.store.as_ref()) {
      warn!(error = %e, "could not write optimistic copy");
    }
    info!(op_id, entity_id = %entity_id, kind = kind.as_str(), reason = %reason, "mutation queued");

    Ok(MutationOutcome::Queued {
      op_id,
      entity_id,
      reason,
    })
  }

  /// Mirror an applied mutation locally before the refresh lands.
  fn apply_synced(&self, payload: &MutationPayload, response: &Response) {
    let result = match payload {
      MutationPayload::Create { .. } => match response.json::<CachedEntity>() {
        Ok(entity) => self.store.upsert_entity(&entity),
        Err(_) => Ok(()),
      },
      MutationPayload::Delete { id } => self.store.remove_entity(id),
      MutationPayload::SetVisibility { id, public } => match self.store.get_entity(id) {
        Ok(Some(mut entity)) => {
          entity.public = *public;
          self.store.upsert_entity(&entity)
        }
        Ok(None) => Ok(()),
        Err(e) => Err(e),
      },
    };
    if let Err(e) = result {
      debug!(error = %e, "local copy not updated");
    }
  }
}

fn sort_newest_first(entities: &mut [CachedEntity]) {
  entities.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Method;
  use crate::model::OperationKind;
  use crate::router::ResponseSource;
  use crate::store::{NoopStore, SqliteStore};
  use crate::sync::DrainOutcome;
  use crate::test_support::{JournalServer, ScriptedTransport};
  use std::time::Duration;

  const BASE: &str = "https://api.test/japp";

  fn config() -> Config {
    Config::from_yaml(&format!(
      "api:\n  base_url: {}\n  username: alice\nnetwork:\n  timeout_secs: 1\n",
      BASE
    ))
    .unwrap()
  }

  async fn engine_with(server: Arc<JournalServer>) -> SyncEngine {
    SyncEngine::with_storage(
      config(),
      server,
      Arc::new(SqliteStore::open_in_memory().unwrap()),
      Arc::new(ResponseCache::open_in_memory().unwrap()),
    )
    .await
  }

  fn text(entry: &str) -> NewEntry {
    NewEntry {
      text: entry.to_string(),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_offline_create_then_reconnect() {
    let server = Arc::new(JournalServer::new(BASE, "alice"));
    let engine = engine_with(server.clone()).await;
    engine.set_online(false);

    let outcome = engine.create_entry(text("hello")).await.unwrap();
    let MutationOutcome::Queued { entity_id, .. } = outcome else {
      panic!("expected queued, got {:?}", outcome);
    };
    assert!(is_local_id(&entity_id));
    assert_eq!(engine.pending_operations().unwrap().len(), 1);

    let local = engine.entries().unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, entity_id);
    assert_eq!(local[0].pending, Some(OperationKind::Create));
    assert!(server.log().is_empty());

    let report = engine.on_reconnect().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Success);
    assert!(engine.pending_operations().unwrap().is_empty());

    let local = engine.entries().unwrap();
    assert_eq!(local.len(), 1);
    assert!(!local[0].is_local());
    assert!(!local[0].is_pending());
    assert_eq!(local[0].text_content, "hello");
  }

  #[tokio::test]
  async fn test_online_create_syncs_immediately() {
    let server = Arc::new(JournalServer::new(BASE, "alice"));
    let engine = engine_with(server.clone()).await;

    let outcome = engine.create_entry(text("now")).await.unwrap();
    assert_eq!(outcome, MutationOutcome::Synced);
    assert_eq!(server.entries().len(), 1);
    assert!(engine.pending_operations().unwrap().is_empty());
    let local = engine.entries().unwrap();
    assert_eq!(local.len(), 1);
    assert!(!local[0].is_local());
  }

  #[tokio::test]
  async fn test_network_failure_queues_and_marks_offline() {
    let server = Arc::new(JournalServer::new(BASE, "alice"));
    let engine = engine_with(server.clone()).await;
    server.set_offline(true);

    let outcome = engine.create_entry(text("lost signal")).await.unwrap();
    assert!(outcome.is_queued());
    assert!(!engine.is_online());
    assert!(server.entries().is_empty());
  }

  #[tokio::test]
  async fn test_rejected_online_mutation_is_surfaced_not_queued() {
    let server = Arc::new(JournalServer::new(BASE, "alice"));
    server.reject_creates(true);
    let engine = engine_with(server).await;

    let err = engine.create_entry(text("bad")).await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteRejected { status: 400, .. }));
    assert!(engine.pending_operations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_operations_on_unsynced_entries_wait_for_their_create() {
    let server = Arc::new(JournalServer::new(BASE, "alice"));
    let engine = engine_with(server.clone()).await;
    engine.set_online(false);
    let MutationOutcome::Queued { entity_id, .. } = engine.create_entry(text("draft")).await.unwrap()
    else {
      panic!("expected queued");
    };

    // Back online but not drained yet: the toggle must queue behind the create.
    engine.set_online(true);
    let outcome = engine.set_visibility(&entity_id, true).await.unwrap();
    assert!(outcome.is_queued());
    assert!(server.log().is_empty());
    let local = engine.entries().unwrap();
    assert!(local[0].public);

    engine.retry_now().await.unwrap();
    let entries = server.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].public);
  }

  #[tokio::test]
  async fn test_offline_delete_marks_entity_pending() {
    let server = Arc::new(JournalServer::new(BASE, "alice"));
    let id = server.seed("keep me?");
    let engine = engine_with(server.clone()).await;
    engine.refresh_entries().await.unwrap();

    engine.set_online(false);
    engine.delete_entry(&id.to_string()).await.unwrap();
    let local = engine.entries().unwrap();
    assert_eq!(local[0].pending, Some(OperationKind::Delete));

    engine.on_reconnect().await.unwrap();
    assert!(server.entries().is_empty());
    assert!(engine.entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_wake_only_for_sync_tag() {
    let server = Arc::new(JournalServer::new(BASE, "alice"));
    let engine = engine_with(server).await;
    assert!(engine.on_wake("other-tag").await.unwrap().is_none());
    let report = engine.on_wake("sync-journal-entries").await.unwrap().unwrap();
    assert_eq!(report.outcome, DrainOutcome::Idle);
  }

  #[tokio::test]
  async fn test_entry_list_falls_back_to_cache_offline() {
    let server = Arc::new(JournalServer::new(BASE, "alice"));
    server.seed("cached");
    let engine = engine_with(server.clone()).await;

    let url = engine.config().api.entries_url();
    let first = engine.fetch(Request::get(&url).unwrap()).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    server.set_offline(true);
    let second = engine.fetch(Request::get(&url).unwrap()).await.unwrap();
    assert_eq!(second.source, ResponseSource::CacheFallback);
    assert_eq!(second.response.body, first.response.body);
    assert_eq!(
      server.log().iter().filter(|(m, _)| *m == Method::Get).count(),
      1
    );
  }

  #[tokio::test]
  async fn test_hung_shell_url_does_not_block_construction() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.hang(Method::Get, "https://app.test/");
    let config = Config::from_yaml(&format!(
      "api:\n  base_url: {}\n  username: alice\n  origin: https://app.test\nnetwork:\n  timeout_secs: 1\n",
      BASE
    ))
    .unwrap();

    let engine = tokio::time::timeout(
      Duration::from_secs(10),
      SyncEngine::with_storage(
        config,
        transport.clone(),
        Arc::new(SqliteStore::open_in_memory().unwrap()),
        Arc::new(ResponseCache::open_in_memory().unwrap()),
      ),
    )
    .await
    .expect("engine construction stuck on a hung shell URL");
    assert_eq!(engine.lifecycle().active_version().as_deref(), Some("v1"));
    assert!(transport
      .calls()
      .iter()
      .any(|(_, url)| url == "https://app.test/"));
  }

  #[tokio::test]
  async fn test_degraded_store_surfaces_storage_errors_when_queueing() {
    let server = Arc::new(JournalServer::new(BASE, "alice"));
    let engine = SyncEngine::with_storage(
      config(),
      server,
      Arc::new(NoopStore),
      Arc::new(ResponseCache::open_in_memory().unwrap()),
    )
    .await;
    assert!(!engine.is_storage_available());
    engine.set_online(false);

    let err = engine.create_entry(text("nowhere")).await.unwrap_err();
    assert!(matches!(err, SyncError::StorageUnavailable(_)));
  }

  #[test]
  fn test_sort_newest_first() {
    let mk = |id: &str, at: &str| CachedEntity {
      id: id.to_string(),
      text_content: String::new(),
      created_at: at.to_string(),
      public: false,
      remote_image_url: None,
      local_image_ref: None,
      pending: None,
      server_public: None,
    };
    let mut list = vec![
      mk("1", "2024-01-01T00:00:00.000Z"),
      mk("2", "2024-03-01T00:00:00.000Z"),
      mk("3", "2024-02-01T00:00:00.000Z"),
    ];
    sort_newest_first(&mut list);
    let ids: Vec<&str> = list.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "3", "1"]);
  }
}
