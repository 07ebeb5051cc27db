//! Domain types mirrored locally: journal entries and queued mutations.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Prefix reserved for ids minted on this device while offline.
pub const LOCAL_ID_PREFIX: &str = "local_";

/// Returns true for ids the server has never seen.
pub fn is_local_id(id: &str) -> bool {
  id.starts_with(LOCAL_ID_PREFIX)
}

/// Current time in the same shape the web client sends (`toISOString`).
pub fn now_iso() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A journal entry as mirrored in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
  #[serde(deserialize_with = "string_or_number")]
  pub id: String,
  #[serde(rename = "textEntry", default)]
  pub text_content: String,
  #[serde(default)]
  pub created_at: String,
  #[serde(rename = "publicStatus", default)]
  pub public: bool,
  #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
  pub remote_image_url: Option<String>,
  /// Reference to an attachment still held in the outbox.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub local_image_ref: Option<String>,
  /// Set while a queued operation targets this entity.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pending: Option<OperationKind>,
  /// Last visibility the server confirmed, kept while a queued change overrides it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub server_public: Option<bool>,
}

impl CachedEntity {
  pub fn is_pending(&self) -> bool {
    self.pending.is_some()
  }

  pub fn is_local(&self) -> bool {
    is_local_id(&self.id)
  }

  /// Image to display; the local copy wins while it exists.
  pub fn display_image(&self) -> Option<&str> {
    self
      .local_image_ref
      .as_deref()
      .or(self.remote_image_url.as_deref())
  }
}

/// Server ids arrive as JSON numbers from some endpoints and strings from others.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Id {
    Text(String),
    Number(i64),
  }

  Ok(match Id::deserialize(deserializer)? {
    Id::Text(s) => s,
    Id::Number(n) => n.to_string(),
  })
}

/// Kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
  Create,
  Delete,
  SetVisibility,
}

impl OperationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationKind::Create => "CREATE",
      OperationKind::Delete => "DELETE",
      OperationKind::SetVisibility => "SET_VISIBILITY",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "CREATE" => Some(OperationKind::Create),
      "DELETE" => Some(OperationKind::Delete),
      "SET_VISIBILITY" => Some(OperationKind::SetVisibility),
      _ => None,
    }
  }
}

/// The JSON part sent as `entryData` when creating an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFields {
  pub text_entry: String,
  pub username: String,
  pub created_at: String,
  #[serde(default)]
  pub public_status: bool,
}

/// Binary attached to a create. The bytes live in their own column, not in
/// the serialized payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
  pub file_name: String,
  pub content_type: String,
  #[serde(skip)]
  pub data: Bytes,
}

/// Everything needed to replay a mutation against the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationPayload {
  Create {
    local_id: String,
    fields: EntryFields,
    attachment: Option<Attachment>,
  },
  Delete {
    id: String,
  },
  SetVisibility {
    id: String,
    public: bool,
  },
}

impl MutationPayload {
  pub fn kind(&self) -> OperationKind {
    match self {
      MutationPayload::Create { .. } => OperationKind::Create,
      MutationPayload::Delete { .. } => OperationKind::Delete,
      MutationPayload::SetVisibility { .. } => OperationKind::SetVisibility,
    }
  }

  /// Id of the entity this mutation acts on.
  pub fn target_id(&self) -> &str {
    match self {
      MutationPayload::Create { local_id, .. } => local_id,
      MutationPayload::Delete { id } => id,
      MutationPayload::SetVisibility { id, .. } => id,
    }
  }

  pub fn attachment(&self) -> Option<&Attachment> {
    match self {
      MutationPayload::Create { attachment, .. } => attachment.as_ref(),
      _ => None,
    }
  }

  /// Copy of this payload aimed at a different entity id.
  pub fn retarget(&self, id: &str) -> Self {
    match self {
      MutationPayload::Create { .. } => self.clone(),
      MutationPayload::Delete { .. } => MutationPayload::Delete { id: id.to_string() },
      MutationPayload::SetVisibility { public, .. } => MutationPayload::SetVisibility {
        id: id.to_string(),
        public: *public,
      },
    }
  }
}

/// A mutation about to be appended to the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
  pub target_url: String,
  pub payload: MutationPayload,
}

/// A row of the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
  /// Store-local sequence number, never sent to the server.
  pub id: i64,
  pub target_url: String,
  pub payload: MutationPayload,
  pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
  pub fn kind(&self) -> OperationKind {
    self.payload.kind()
  }

  pub fn target_id(&self) -> &str {
    self.payload.target_id()
  }
}

/// An operation abandoned after repeated permanent failures.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
  pub operation: PendingOperation,
  pub attempts: u32,
  pub reason: String,
  pub failed_at: DateTime<Utc>,
}

/// Input for creating a new journal entry.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
  pub text: String,
  pub public: bool,
  pub attachment: Option<Attachment>,
}

/// Mints `local_<millis>` ids that stay unique even within one millisecond.
#[derive(Debug, Default)]
pub struct LocalIds {
  last: AtomicI64,
}

impl LocalIds {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn next(&self) -> String {
    let now = Utc::now().timestamp_millis();
    let mut prev = self.last.load(Ordering::Relaxed);
    loop {
      let candidate = if now > prev { now } else { prev + 1 };
      match self
        .last
        .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::Relaxed)
      {
        Ok(_) => return format!("{}{}", LOCAL_ID_PREFIX, candidate),
        Err(actual) => prev = actual,
      }
    }
  }
}
