//! Error taxonomy shared by every sync component.

/// Errors produced by the store, cache, router and reconciler.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error("Local store unavailable: {0}")]
  StorageUnavailable(String),

  #[error("Network unreachable: {0}")]
  NetworkUnreachable(String),

  #[error("Server rejected {method} {url} with status {status}")]
  RemoteRejected {
    method: String,
    url: String,
    status: u16,
  },

  #[error("Cache partition {partition} failed: {reason}")]
  PartitionCorrupt { partition: String, reason: String },

  #[error("No network response and no cached copy for {0}")]
  NoResponse(String),

  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

impl SyncError {
  /// Whether retrying the same request later could plausibly succeed.
  ///
  /// Network failures, 408, 429 and 5xx are transient. Every other
  /// rejection is permanent and counts toward dead-lettering.
  pub fn is_transient(&self) -> bool {
    match self {
      SyncError::NetworkUnreachable(_) => true,
      SyncError::RemoteRejected { status, .. } => {
        *status == 408 || *status == 429 || *status >= 500
      }
      _ => false,
    }
  }

  /// Whether this failure means the network could not be reached at all.
  pub fn is_offline(&self) -> bool {
    matches!(self, SyncError::NetworkUnreachable(_))
  }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
