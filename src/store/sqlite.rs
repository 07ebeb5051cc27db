//! SQLite implementation of the local store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::schema::SCHEMA;
use super::{AttemptState, LocalStore};
use crate::error::{Result, SyncError};
use crate::model::{CachedEntity, DeadLetter, MutationPayload, NewOperation, PendingOperation};

/// SQLite-backed local store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at `path`. Safe to call on an existing database.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageUnavailable(format!("Failed to create store directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageUnavailable(format!(
        "Failed to open store at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
      .map_err(|e| SyncError::StorageUnavailable(format!("Failed to enable WAL: {}", e)))?;

    Self::from_connection(conn)
  }

  /// Private in-memory store, mostly for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| SyncError::StorageUnavailable(format!("Failed to run migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

fn encode_time(t: &DateTime<Utc>) -> String {
  t.to_rfc3339()
}

fn decode_time(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|t| t.with_timezone(&Utc))
    .map_err(|e| SyncError::StorageUnavailable(format!("Bad timestamp '{}': {}", s, e)))
}

/// Raw outbox columns, decoded outside the rusqlite row callback.
struct OperationRow {
  id: i64,
  target_url: String,
  payload: String,
  attachment: Option<Vec<u8>>,
  enqueued_at: String,
}

impl OperationRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      target_url: row.get(1)?,
      payload: row.get(2)?,
      attachment: row.get(3)?,
      enqueued_at: row.get(4)?,
    })
  }

  fn decode(self) -> Result<PendingOperation> {
    let mut payload: MutationPayload = serde_json::from_str(&self.payload)?;
    if let (MutationPayload::Create {
      attachment: Some(file),
      ..
    }, Some(data)) = (&mut payload, self.attachment)
    {
      file.data = data.into();
    }

    Ok(PendingOperation {
      id: self.id,
      target_url: self.target_url,
      payload,
      enqueued_at: decode_time(&self.enqueued_at)?,
    })
  }
}

impl LocalStore for SqliteStore {
  fn is_available(&self) -> bool {
    true
  }

  fn replace_all_entities(&self, entities: &[CachedEntity]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM entities", [])?;
    {
      let mut stmt =
        tx.prepare("INSERT OR REPLACE INTO entities (id, data, cached_at) VALUES (?, ?, datetime('now'))")?;
      for entity in entities {
        let data = serde_json::to_vec(entity)?;
        stmt.execute(params![entity.id, data])?;
      }
    }

    tx.commit()?;
    debug!(count = entities.len(), "replaced cached entities");
    Ok(())
  }

  fn list_entities(&self) -> Result<Vec<CachedEntity>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT id, data FROM entities")?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<rusqlite::Result<_>>()?;

    let mut entities = Vec::with_capacity(rows.len());
    for (id, data) in rows {
      match serde_json::from_slice(&data) {
        Ok(entity) => entities.push(entity),
        Err(e) => warn!(id = %id, error = %e, "skipping undecodable entity row"),
      }
    }
    Ok(entities)
  }

  fn get_entity(&self, id: &str) -> Result<Option<CachedEntity>> {
    let conn = self.conn()?;
    let data: Option<Vec<u8>> = conn
      .query_row("SELECT data FROM entities WHERE id = ?", params![id], |row| {
        row.get(0)
      })
      .optional()?;

    match data {
      Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
      None => Ok(None),
    }
  }

  fn upsert_entity(&self, entity: &CachedEntity) -> Result<()> {
    let conn = self.conn()?;
    let data = serde_json::to_vec(entity)?;
    conn.execute(
      "INSERT OR REPLACE INTO entities (id, data, cached_at) VALUES (?, ?, datetime('now'))",
      params![entity.id, data],
    )?;
    Ok(())
  }

  fn remove_entity(&self, id: &str) -> Result<()> {
    let conn = self.conn()?;
    conn.execute("DELETE FROM entities WHERE id = ?", params![id])?;
    Ok(())
  }

  fn enqueue_operation(&self, op: &NewOperation) -> Result<i64> {
    let conn = self.conn()?;
    let payload = serde_json::to_string(&op.payload)?;
    let attachment = op.payload.attachment().map(|a| a.data.to_vec());

    conn.execute(
      "INSERT INTO pending_operations (kind, target_url, target_id, payload, attachment, enqueued_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        op.payload.kind().as_str(),
        op.target_url,
        op.payload.target_id(),
        payload,
        attachment,
        encode_time(&Utc::now()),
      ],
    )?;

    let id = conn.last_insert_rowid();
    debug!(op_id = id, kind = op.payload.kind().as_str(), "enqueued operation");
    Ok(id)
  }

  fn list_pending_operations(&self) -> Result<Vec<PendingOperation>> {
    let rows: Vec<OperationRow> = {
      let conn = self.conn()?;
      let mut stmt = conn.prepare(
        "SELECT id, target_url, payload, attachment, enqueued_at
         FROM pending_operations ORDER BY id",
      )?;
      let rows = stmt
        .query_map([], OperationRow::from_row)?
        .collect::<rusqlite::Result<_>>()?;
      rows
    };

    rows.into_iter().map(OperationRow::decode).collect()
  }

  fn remove_pending_operation(&self, id: i64) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM pending_operations WHERE id = ?", params![id])?;
    tx.execute("DELETE FROM operation_attempts WHERE op_id = ?", params![id])?;
    tx.commit()?;
    Ok(())
  }

  fn record_failure(&self, id: i64, reason: &str, next_attempt_at: DateTime<Utc>) -> Result<u32> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT INTO operation_attempts (op_id, attempts, last_error, next_attempt_at)
       VALUES (?1, 1, ?2, ?3)
       ON CONFLICT(op_id) DO UPDATE SET
         attempts = attempts + 1,
         last_error = excluded.last_error,
         next_attempt_at = excluded.next_attempt_at",
      params![id, reason, encode_time(&next_attempt_at)],
    )?;

    let attempts: u32 = conn.query_row(
      "SELECT attempts FROM operation_attempts WHERE op_id = ?",
      params![id],
      |row| row.get(0),
    )?;
    Ok(attempts)
  }

  fn attempt_state(&self, id: i64) -> Result<Option<AttemptState>> {
    let conn = self.conn()?;
    let row: Option<(u32, Option<String>, String)> = conn
      .query_row(
        "SELECT attempts, last_error, next_attempt_at FROM operation_attempts WHERE op_id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    match row {
      Some((attempts, last_error, next)) => Ok(Some(AttemptState {
        attempts,
        last_error,
        next_attempt_at: decode_time(&next)?,
      })),
      None => Ok(None),
    }
  }

  fn dead_letter(&self, id: i64, reason: &str) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let moved = tx.execute(
      "INSERT OR REPLACE INTO dead_letters
         (op_id, kind, target_url, payload, attachment, enqueued_at, attempts, reason, failed_at)
       SELECT p.id, p.kind, p.target_url, p.payload, p.attachment, p.enqueued_at,
              COALESCE(a.attempts, 0), ?2, ?3
       FROM pending_operations p
       LEFT JOIN operation_attempts a ON a.op_id = p.id
       WHERE p.id = ?1",
      params![id, reason, encode_time(&Utc::now())],
    )?;
    tx.execute("DELETE FROM pending_operations WHERE id = ?", params![id])?;
    tx.execute("DELETE FROM operation_attempts WHERE op_id = ?", params![id])?;
    tx.commit()?;

    debug!(op_id = id, moved, "dead-lettered operation");
    Ok(())
  }

  fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let rows: Vec<(OperationRow, u32, String, String)> = {
      let conn = self.conn()?;
      let mut stmt = conn.prepare(
        "SELECT op_id, target_url, payload, attachment, enqueued_at, attempts, reason, failed_at
         FROM dead_letters ORDER BY op_id",
      )?;
      let rows = stmt
        .query_map([], |row| {
          Ok((
            OperationRow::from_row(row)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
          ))
        })?
        .collect::<rusqlite::Result<_>>()?;
      rows
    };

    rows
      .into_iter()
      .map(|(op, attempts, reason, failed_at)| {
        Ok(DeadLetter {
          operation: op.decode()?,
          attempts,
          reason,
          failed_at: decode_time(&failed_at)?,
        })
      })
      .collect()
  }

  fn record_remap(&self, local_id: &str, server_id: &str) -> Result<()> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO id_remaps (local_id, server_id, remapped_at)
       VALUES (?, ?, datetime('now'))",
      params![local_id, server_id],
    )?;
    Ok(())
  }

  fn resolve_id(&self, local_id: &str) -> Result<Option<String>> {
    let conn = self.conn()?;
    let server_id = conn
      .query_row(
        "SELECT server_id FROM id_remaps WHERE local_id = ?",
        params![local_id],
        |row| row.get(0),
      )
      .optional()?;
    Ok(server_id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Attachment, EntryFields, OperationKind};
  use std::sync::Arc;

  fn entity(id: &str, text: &str) -> CachedEntity {
    CachedEntity {
      id: id.to_string(),
      text_content: text.to_string(),
      created_at: "2024-05-01T10:00:00.000Z".to_string(),
      public: false,
      remote_image_url: None,
      local_image_ref: None,
      pending: None,
      server_public: None,
    }
  }

  fn delete_op(id: &str) -> NewOperation {
    NewOperation {
      target_url: format!("https://api.test/japp/entries/{}", id),
      payload: MutationPayload::Delete { id: id.to_string() },
    }
  }

  fn create_op(local_id: &str, with_image: bool) -> NewOperation {
    NewOperation {
      target_url: "https://api.test/japp/create".to_string(),
      payload: MutationPayload::Create {
        local_id: local_id.to_string(),
        fields: EntryFields {
          text_entry: "hello".to_string(),
          username: "alice".to_string(),
          created_at: "2024-05-01T10:00:00.000Z".to_string(),
          public_status: false,
        },
        attachment: with_image.then(|| Attachment {
          file_name: "cat.png".to_string(),
          content_type: "image/png".to_string(),
          data: bytes::Bytes::from_static(b"\x89PNG"),
        }),
      },
    }
  }

  #[test]
  fn test_open_is_idempotent_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.upsert_entity(&entity("1", "kept")).unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.list_entities().unwrap().len(), 1);
  }

  #[test]
  fn test_replace_all_entities_reflects_exactly_the_list() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .replace_all_entities(&[entity("1", "a"), entity("2", "b")])
      .unwrap();
    store.replace_all_entities(&[entity("3", "c")]).unwrap();

    let ids: Vec<String> = store.list_entities().unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["3"]);
  }

  #[test]
  fn test_undecodable_rows_are_skipped() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.upsert_entity(&entity("1", "fine")).unwrap();
    store
      .conn()
      .unwrap()
      .execute(
        "INSERT INTO entities (id, data) VALUES ('2', ?)",
        params![b"not json".to_vec()],
      )
      .unwrap();

    let listed = store.list_entities().unwrap();
    assert_eq!(listed, vec![entity("1", "fine")]);
  }

  #[test]
  fn test_concurrent_replacements_never_interleave() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let first: Vec<CachedEntity> = (0..200).map(|i| entity(&format!("a{}", i), "a")).collect();
    let second: Vec<CachedEntity> = (0..150).map(|i| entity(&format!("b{}", i), "b")).collect();

    let handles: Vec<_> = [first.clone(), second.clone()]
      .into_iter()
      .map(|list| {
        let store = Arc::clone(&store);
        std::thread::spawn(move || store.replace_all_entities(&list).unwrap())
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }

    let mut ids: Vec<String> = store.list_entities().unwrap().into_iter().map(|e| e.id).collect();
    ids.sort();
    let mut expect_a: Vec<String> = first.into_iter().map(|e| e.id).collect();
    let mut expect_b: Vec<String> = second.into_iter().map(|e| e.id).collect();
    expect_a.sort();
    expect_b.sort();
    assert!(ids == expect_a || ids == expect_b, "table mixed both inputs");
  }

  #[test]
  fn test_outbox_preserves_enqueue_order_and_attachments() {
    let store = SqliteStore::open_in_memory().unwrap();
    let a = store.enqueue_operation(&create_op("local_1", true)).unwrap();
    let b = store.enqueue_operation(&delete_op("local_1")).unwrap();
    let c = store.enqueue_operation(&delete_op("17")).unwrap();
    assert!(a < b && b < c);

    let ops = store.list_pending_operations().unwrap();
    let kinds: Vec<OperationKind> = ops.iter().map(|o| o.kind()).collect();
    assert_eq!(
      kinds,
      vec![OperationKind::Create, OperationKind::Delete, OperationKind::Delete]
    );
    let attachment = ops[0].payload.attachment().unwrap();
    assert_eq!(&attachment.data[..], b"\x89PNG");
    assert_eq!(ops[1].target_id(), "local_1");
  }

  #[test]
  fn test_remove_pending_operation_is_idempotent() {
    let store = SqliteStore::open_in_memory().unwrap();
    let id = store.enqueue_operation(&delete_op("5")).unwrap();
    store.remove_pending_operation(id).unwrap();
    store.remove_pending_operation(id).unwrap();
    assert!(store.list_pending_operations().unwrap().is_empty());
  }

  #[test]
  fn test_ids_are_not_reused_after_removal() {
    let store = SqliteStore::open_in_memory().unwrap();
    let first = store.enqueue_operation(&delete_op("1")).unwrap();
    store.remove_pending_operation(first).unwrap();
    let second = store.enqueue_operation(&delete_op("2")).unwrap();
    assert!(second > first);
  }

  #[test]
  fn test_failures_accumulate_then_dead_letter_moves_row() {
    let store = SqliteStore::open_in_memory().unwrap();
    let id = store.enqueue_operation(&create_op("local_9", false)).unwrap();

    let later = Utc::now() + chrono::Duration::seconds(30);
    assert_eq!(store.record_failure(id, "status 400", later).unwrap(), 1);
    assert_eq!(store.record_failure(id, "status 400", later).unwrap(), 2);
    let state = store.attempt_state(id).unwrap().unwrap();
    assert_eq!(state.attempts, 2);
    assert_eq!(state.last_error.as_deref(), Some("status 400"));

    store.dead_letter(id, "permanently rejected").unwrap();
    assert!(store.list_pending_operations().unwrap().is_empty());
    assert!(store.attempt_state(id).unwrap().is_none());

    let dead = store.list_dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(dead[0].operation.target_id(), "local_9");
  }

  #[test]
  fn test_remaps_resolve() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.resolve_id("local_1").unwrap(), None);
    store.record_remap("local_1", "101").unwrap();
    assert_eq!(store.resolve_id("local_1").unwrap().as_deref(), Some("101"));
  }

  #[test]
  fn test_entity_upsert_get_remove() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut e = entity("local_3", "draft");
    e.pending = Some(OperationKind::Create);
    store.upsert_entity(&e).unwrap();
    assert_eq!(store.get_entity("local_3").unwrap(), Some(e));
    store.remove_entity("local_3").unwrap();
    store.remove_entity("local_3").unwrap();
    assert_eq!(store.get_entity("local_3").unwrap(), None);
  }
}
