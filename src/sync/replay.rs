//! Building replay requests and reading entry lists back.

use serde_json::json;

use crate::error::{Result, SyncError};
use crate::http::{Method, Request, RequestBody, Response};
use crate::model::{CachedEntity, MutationPayload};

/// Multipart part names the create endpoint expects.
pub const ENTRY_PART: &str = "entryData";
pub const FILE_PART: &str = "file";

/// The HTTP request that applies `payload` at `url`.
pub fn build_request(url: &str, payload: &MutationPayload) -> Result<Request> {
  match payload {
    MutationPayload::Create {
      fields, attachment, ..
    } => Ok(Request::new(Method::Post, url)?.with_body(RequestBody::Multipart {
      json_part: ENTRY_PART.to_string(),
      json: serde_json::to_value(fields)?,
      file_part: FILE_PART.to_string(),
      file: attachment.clone(),
    })),
    MutationPayload::Delete { .. } => Request::delete(url),
    MutationPayload::SetVisibility { public, .. } => {
      Request::put_json(url, json!({ "publicStatus": public }))
    }
  }
}

/// Swap the id segment `from` for `to` in a captured target URL.
pub fn rewrite_url(url: &str, from: &str, to: &str) -> String {
  let inner = format!("/{}/", from);
  if url.contains(&inner) {
    return url.replacen(&inner, &format!("/{}/", to), 1);
  }
  let tail = format!("/{}", from);
  match url.strip_suffix(&tail) {
    Some(prefix) => format!("{}/{}", prefix, to),
    None => url.to_string(),
  }
}

/// Parse an entry-list response. 204 and empty bodies mean no entries.
pub fn parse_entry_list(response: &Response) -> Result<Vec<CachedEntity>> {
  if !response.is_success() {
    return Err(SyncError::RemoteRejected {
      method: "GET".to_string(),
      url: "entries".to_string(),
      status: response.status,
    });
  }
  if response.status == 204 || response.body.iter().all(|b| b.is_ascii_whitespace()) {
    return Ok(Vec::new());
  }
  response.json()
}
