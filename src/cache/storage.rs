//! SQLite storage for cached HTTP responses.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::partition::{PartitionName, Purpose};
use crate::error::{Result, SyncError};
use crate::http::{Request, RequestIdentity, Response, Transport};

/// A stored response and when it was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

/// Outcome of a precache run. Failures are advisory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrecacheReport {
  pub stored: Vec<String>,
  pub failed: Vec<(String, String)>,
}

/// Shell fetches in flight at once during precache.
const PRECACHE_CONCURRENCY: usize = 4;

/// Schema for response cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    purpose TEXT NOT NULL,
    version TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (partition, request_hash)
);
"#;

/// Named, versioned response partitions backed by SQLite.
pub struct ResponseCache {
  conn: Mutex<Connection>,
}

impl ResponseCache {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageUnavailable(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageUnavailable(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;

    Self::from_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(CACHE_SCHEMA).map_err(|e| {
      SyncError::StorageUnavailable(format!("Failed to run cache migrations: {}", e))
    })?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self, partition: &str) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| SyncError::PartitionCorrupt {
      partition: partition.to_string(),
      reason: format!("Lock poisoned: {}", e),
    })
  }

  /// Open or create the partition for `purpose` at `version`.
  pub fn ensure_partition(&self, purpose: Purpose, version: &str) -> Result<PartitionName> {
    let name = PartitionName::new(purpose, version);
    let conn = self.conn(&name.to_string())?;
    insert_partition(&conn, &name).map_err(|e| corrupt(&name, e))?;
    Ok(name)
  }

  /// Every partition name currently present, ours or not.
  pub fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.conn("*")?;
    let mut stmt = conn
      .prepare(
        "SELECT name FROM cache_partitions
         UNION SELECT DISTINCT partition FROM cache_entries
         ORDER BY 1",
      )
      .map_err(|e| corrupt_named("*", e))?;
    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| corrupt_named("*", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| corrupt_named("*", e))?;
    Ok(names)
  }

  /// Stored response for `identity` in `partition`. Never mutates.
  pub fn lookup(
    &self,
    partition: &PartitionName,
    identity: &RequestIdentity,
  ) -> Result<Option<CachedResponse>> {
    let conn = self.conn(&partition.to_string())?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE partition = ? AND request_hash = ?",
        params![partition.to_string(), identity.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| corrupt(partition, e))?;

    let Some((status, headers, body, stored_at)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> =
      serde_json::from_str(&headers).map_err(|e| SyncError::PartitionCorrupt {
        partition: partition.to_string(),
        reason: format!("Bad stored headers: {}", e),
      })?;
    let stored_at = DateTime::parse_from_rfc3339(&stored_at)
      .map(|t| t.with_timezone(&Utc))
      .map_err(|e| SyncError::PartitionCorrupt {
        partition: partition.to_string(),
        reason: format!("Bad stored timestamp: {}", e),
      })?;

    Ok(Some(CachedResponse {
      response: Response {
        status,
        headers,
        body: body.into(),
      },
      stored_at,
    }))
  }

  /// Insert or replace the entry for `identity`.
  ///
  /// Only 2xx responses are cached; anything else is ignored and `false` returned.
  pub fn store(
    &self,
    partition: &PartitionName,
    identity: &RequestIdentity,
    response: &Response,
  ) -> Result<bool> {
    if !response.is_success() {
      debug!(partition = %partition, status = response.status, "not caching error response");
      return Ok(false);
    }

    let headers = serde_json::to_string(&response.headers)?;
    let mut conn = self.conn(&partition.to_string())?;
    let tx = conn.transaction().map_err(|e| corrupt(partition, e))?;
    insert_partition(&tx, partition).map_err(|e| corrupt(partition, e))?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition, request_hash, request_key, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition.to_string(),
        identity.cache_hash(),
        identity.as_str(),
        response.status,
        headers,
        response.body.as_ref(),
        Utc::now().to_rfc3339(),
      ],
    )
    .map_err(|e| corrupt(partition, e))?;
    tx.commit().map_err(|e| corrupt(partition, e))?;

    Ok(true)
  }

  /// Number of entries held in `partition`.
  pub fn entry_count(&self, partition: &PartitionName) -> Result<usize> {
    let conn = self.conn(&partition.to_string())?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
        params![partition.to_string()],
        |row| row.get(0),
      )
      .map_err(|e| corrupt(partition, e))?;
    Ok(count as usize)
  }

  /// Delete every partition with a known purpose prefix that is not in `current`.
  ///
  /// Returns the names deleted. Names with unknown prefixes are left alone.
  pub fn evict_stale_partitions(&self, current: &[PartitionName]) -> Result<Vec<String>> {
    let keep: BTreeSet<String> = current.iter().map(|p| p.to_string()).collect();
    let stale: Vec<String> = self
      .partition_names()?
      .into_iter()
      .filter(|name| PartitionName::parse(name).is_some() && !keep.contains(name))
      .collect();

    if stale.is_empty() {
      return Ok(stale);
    }

    let mut conn = self.conn("*")?;
    let tx = conn.transaction().map_err(|e| corrupt_named("*", e))?;
    for name in &stale {
      tx.execute("DELETE FROM cache_entries WHERE partition = ?", params![name])
        .map_err(|e| corrupt_named(name, e))?;
      tx.execute("DELETE FROM cache_partitions WHERE name = ?", params![name])
        .map_err(|e| corrupt_named(name, e))?;
    }
    tx.commit().map_err(|e| corrupt_named("*", e))?;

    for name in &stale {
      info!(partition = %name, "evicted stale cache partition");
    }
    Ok(stale)
  }

  /// Fetch each URL and store successful responses in the partition.
  ///
  /// One failing URL never aborts the rest. Each fetch gets `timeout`.
  pub async fn precache(
    &self,
    transport: &dyn Transport,
    purpose: Purpose,
    version: &str,
    urls: &[String],
    timeout: Duration,
  ) -> Result<PrecacheReport> {
    use futures::StreamExt;

    let partition = self.ensure_partition(purpose, version)?;
    let partition_ref = &partition;
    let results: Vec<(String, Result<()>)> = futures::stream::iter(urls)
      .map(|url| async move {
        (
          url.clone(),
          self.precache_one(transport, partition_ref, url, timeout).await,
        )
      })
      .buffered(PRECACHE_CONCURRENCY)
      .collect()
      .await;

    let mut report = PrecacheReport::default();
    for (url, result) in results {
      match result {
        Ok(()) => report.stored.push(url),
        Err(e) => {
          warn!(url = %url, error = %e, "precache failed, continuing");
          report.failed.push((url, e.to_string()));
        }
      }
    }

    info!(
      partition = %partition,
      stored = report.stored.len(),
      failed = report.failed.len(),
      "precache finished"
    );
    Ok(report)
  }

  async fn precache_one(
    &self,
    transport: &dyn Transport,
    partition: &PartitionName,
    url: &str,
    timeout: Duration,
  ) -> Result<()> {
    let request = Request::get(url)?;
    let response = match tokio::time::timeout(timeout, transport.send(&request)).await {
      Ok(result) => result?.error_for_status(&request)?,
      Err(_) => {
        return Err(SyncError::NetworkUnreachable(format!(
          "{} timed out after {:?}",
          request.url, timeout
        )))
      }
    };
    if let Some(identity) = request.identity() {
      self.store(partition, &identity, &response)?;
    }
    Ok(())
  }
}

fn insert_partition(conn: &Connection, name: &PartitionName) -> rusqlite::Result<usize> {
  conn.execute(
    "INSERT OR IGNORE INTO cache_partitions (name, purpose, version) VALUES (?, ?, ?)",
    params![name.to_string(), name.purpose.slug(), name.version],
  )
}

fn corrupt(partition: &PartitionName, e: rusqlite::Error) -> SyncError {
  corrupt_named(&partition.to_string(), e)
}

fn corrupt_named(partition: &str, e: rusqlite::Error) -> SyncError {
  SyncError::PartitionCorrupt {
    partition: partition.to_string(),
    reason: e.to_string(),
  }
}
