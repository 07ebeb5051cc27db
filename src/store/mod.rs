//! Durable local store: mirrored entities plus the pending-operation outbox.
//!
//! Two implementations:
//! - `SqliteStore`, the real store, one transaction per multi-row write
//! - `NoopStore`, used when the database cannot be opened. Reads come back
//!   empty and writes fail with `StorageUnavailable` so callers retry later.

mod schema;
mod sqlite;

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::model::{CachedEntity, DeadLetter, NewOperation, PendingOperation};

pub use sqlite::SqliteStore;

/// Retry bookkeeping kept beside an outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptState {
  pub attempts: u32,
  pub last_error: Option<String>,
  pub next_attempt_at: DateTime<Utc>,
}

/// Trait for local store backends.
pub trait LocalStore: Send + Sync {
  /// False for the degraded store.
  fn is_available(&self) -> bool;

  /// Atomically clear the entity table and fill it with `entities`.
  fn replace_all_entities(&self, entities: &[CachedEntity]) -> Result<()>;

  /// All cached entities, unspecified order.
  fn list_entities(&self) -> Result<Vec<CachedEntity>>;

  fn get_entity(&self, id: &str) -> Result<Option<CachedEntity>>;

  /// Insert or replace one entity (optimistic copies).
  fn upsert_entity(&self, entity: &CachedEntity) -> Result<()>;

  /// Delete one entity. Missing ids are not an error.
  fn remove_entity(&self, id: &str) -> Result<()>;

  /// Append to the outbox, returning the fresh local id.
  fn enqueue_operation(&self, op: &NewOperation) -> Result<i64>;

  /// Outbox contents in enqueue order.
  fn list_pending_operations(&self) -> Result<Vec<PendingOperation>>;

  /// Delete one outbox row. Idempotent.
  fn remove_pending_operation(&self, id: i64) -> Result<()>;

  /// Count a failed replay, returning the new attempt count.
  fn record_failure(&self, id: i64, reason: &str, next_attempt_at: DateTime<Utc>) -> Result<u32>;

  fn attempt_state(&self, id: i64) -> Result<Option<AttemptState>>;

  /// Move an outbox row into the dead-letter table.
  fn dead_letter(&self, id: i64, reason: &str) -> Result<()>;

  fn list_dead_letters(&self) -> Result<Vec<DeadLetter>>;

  /// Remember that a locally minted id became `server_id` on the server.
  fn record_remap(&self, local_id: &str, server_id: &str) -> Result<()>;

  /// Server id for a local id, if its create has been replayed.
  fn resolve_id(&self, local_id: &str) -> Result<Option<String>>;
}

/// Open the SQLite store at `path`, falling back to the degraded store.
pub fn open_or_degraded(path: &Path) -> Arc<dyn LocalStore> {
  match SqliteStore::open(path) {
    Ok(store) => Arc::new(store),
    Err(e) => {
      warn!(error = %e, path = %path.display(), "local store unavailable, running degraded");
      Arc::new(NoopStore)
    }
  }
}

/// Store used when the real one could not be opened.
pub struct NoopStore;

fn unavailable<T>() -> Result<T> {
  Err(SyncError::StorageUnavailable(
    "local store failed to open".to_string(),
  ))
}

impl LocalStore for NoopStore {
  fn is_available(&self) -> bool {
    false
  }

  fn replace_all_entities(&self, _entities: &[CachedEntity]) -> Result<()> {
    unavailable()
  }

  fn list_entities(&self) -> Result<Vec<CachedEntity>> {
    Ok(Vec::new())
  }

  fn get_entity(&self, _id: &str) -> Result<Option<CachedEntity>> {
    Ok(None)
  }

  fn upsert_entity(&self, _entity: &CachedEntity) -> Result<()> {
    unavailable()
  }

  fn remove_entity(&self, _id: &str) -> Result<()> {
    unavailable()
  }

  fn enqueue_operation(&self, _op: &NewOperation) -> Result<i64> {
    unavailable()
  }

  fn list_pending_operations(&self) -> Result<Vec<PendingOperation>> {
    Ok(Vec::new())
  }

  fn remove_pending_operation(&self, _id: i64) -> Result<()> {
    unavailable()
  }

  fn record_failure(&self, _id: i64, _reason: &str, _next: DateTime<Utc>) -> Result<u32> {
    unavailable()
  }

  fn attempt_state(&self, _id: i64) -> Result<Option<AttemptState>> {
    Ok(None)
  }

  fn dead_letter(&self, _id: i64, _reason: &str) -> Result<()> {
    unavailable()
  }

  fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
    Ok(Vec::new())
  }

  fn record_remap(&self, _local_id: &str, _server_id: &str) -> Result<()> {
    unavailable()
  }

  fn resolve_id(&self, _local_id: &str) -> Result<Option<String>> {
    Ok(None)
  }
}
