//! In-memory transports for unit tests.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::http::{Method, Request, RequestBody, Response, Transport};

#[derive(Debug, Clone)]
enum Scripted {
  Respond(Response),
  Fail,
  Hang,
}

#[derive(Default)]
struct ScriptState {
  once: HashMap<(Method, String), VecDeque<Scripted>>,
  always: HashMap<(Method, String), Scripted>,
  offline: bool,
  requests: Vec<Request>,
}

/// Transport serving canned responses per (method, url). Unknown routes get a 404.
#[derive(Default)]
pub struct ScriptedTransport {
  state: Mutex<ScriptState>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, method: Method, url: &str, response: Response) {
    self.set_always(method, url, Scripted::Respond(response));
  }

  pub fn respond_once(&self, method: Method, url: &str, response: Response) {
    let mut state = self.state.lock().unwrap();
    state
      .once
      .entry((method, url.to_string()))
      .or_default()
      .push_back(Scripted::Respond(response));
  }

  pub fn fail(&self, method: Method, url: &str) {
    self.set_always(method, url, Scripted::Fail);
  }

  pub fn hang(&self, method: Method, url: &str) {
    self.set_always(method, url, Scripted::Hang);
  }

  pub fn set_offline(&self, offline: bool) {
    self.state.lock().unwrap().offline = offline;
  }

  pub fn calls(&self) -> Vec<(Method, String)> {
    self
      .state
      .lock()
      .unwrap()
      .requests
      .iter()
      .map(|r| (r.method, r.url.to_string()))
      .collect()
  }

  pub fn call_count(&self) -> usize {
    self.state.lock().unwrap().requests.len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.state.lock().unwrap().requests.clone()
  }

  fn set_always(&self, method: Method, url: &str, scripted: Scripted) {
    self
      .state
      .lock()
      .unwrap()
      .always
      .insert((method, url.to_string()), scripted);
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, request: &Request) -> Result<Response> {
    let scripted = {
      let mut state = self.state.lock().unwrap();
      state.requests.push(request.clone());
      if state.offline {
        Scripted::Fail
      } else {
        let key = (request.method, request.url.to_string());
        match state.once.get_mut(&key).and_then(|q| q.pop_front()) {
          Some(s) => s,
          None => state
            .always
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Scripted::Respond(Response::new(404, "not found"))),
        }
      }
    };

    match scripted {
      Scripted::Respond(response) => Ok(response),
      Scripted::Fail => Err(SyncError::NetworkUnreachable(format!(
        "scripted failure for {}",
        request.url
      ))),
      Scripted::Hang => {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(SyncError::NetworkUnreachable("hung".into()))
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerEntry {
  pub id: i64,
  pub text: String,
  pub public: bool,
  pub has_image: bool,
}

#[derive(Default)]
struct ServerState {
  entries: Vec<ServerEntry>,
  next_id: i64,
  offline: bool,
  reject_creates: bool,
  log: Vec<(Method, String)>,
}

/// A tiny journal API that applies mutations for real, so tests can check
/// what the server ended up with.
pub struct JournalServer {
  base: String,
  username: String,
  state: Mutex<ServerState>,
}

impl JournalServer {
  pub fn new(base: &str, username: &str) -> Self {
    Self {
      base: base.trim_end_matches('/').to_string(),
      username: username.to_string(),
      state: Mutex::new(ServerState {
        next_id: 100,
        ..Default::default()
      }),
    }
  }

  pub fn set_offline(&self, offline: bool) {
    self.state.lock().unwrap().offline = offline;
  }

  pub fn reject_creates(&self, reject: bool) {
    self.state.lock().unwrap().reject_creates = reject;
  }

  pub fn entries(&self) -> Vec<ServerEntry> {
    self.state.lock().unwrap().entries.clone()
  }

  pub fn seed(&self, text: &str) -> i64 {
    let mut state = self.state.lock().unwrap();
    state.next_id += 1;
    let id = state.next_id;
    state.entries.push(ServerEntry {
      id,
      text: text.to_string(),
      public: false,
      has_image: false,
    });
    id
  }

  pub fn log(&self) -> Vec<(Method, String)> {
    self.state.lock().unwrap().log.clone()
  }

  fn entry_json(&self, entry: &ServerEntry) -> serde_json::Value {
    json!({
      "id": entry.id,
      "textEntry": entry.text,
      "createdAt": "2024-05-01T10:00:00.000Z",
      "publicStatus": entry.public,
      "imageUrl": entry.has_image.then(|| format!("https://img.test/{}.png", entry.id)),
      "username": self.username,
    })
  }
}

#[async_trait]
impl Transport for JournalServer {
  async fn send(&self, request: &Request) -> Result<Response> {
    let mut state = self.state.lock().unwrap();
    if state.offline {
      return Err(SyncError::NetworkUnreachable("server offline".into()));
    }
    state.log.push((request.method, request.url.to_string()));

    let path = request
      .url
      .as_str()
      .strip_prefix(&self.base)
      .unwrap_or_default()
      .to_string();
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    let response = match (request.method, segments.as_slice()) {
      (Method::Post, ["create"]) => {
        if state.reject_creates {
          return Ok(Response::new(400, "bad entry"));
        }
        let (fields, has_image) = match &request.body {
          RequestBody::Multipart { json, file, .. } => (json.clone(), file.is_some()),
          _ => return Ok(Response::new(415, "expected multipart")),
        };
        state.next_id += 1;
        let entry = ServerEntry {
          id: state.next_id,
          text: fields["textEntry"].as_str().unwrap_or_default().to_string(),
          public: fields["publicStatus"].as_bool().unwrap_or(false),
          has_image,
        };
        let body = self.entry_json(&entry);
        state.entries.push(entry);
        Response::new(200, body.to_string())
      }
      (Method::Delete, ["entries", id]) => {
        let before = state.entries.len();
        state.entries.retain(|e| e.id.to_string() != *id);
        if state.entries.len() < before {
          Response::new(200, "")
        } else {
          Response::new(404, "no such entry")
        }
      }
      (Method::Put, ["entries", id, "status"]) => {
        let public = match &request.body {
          RequestBody::Json(v) => v["publicStatus"].as_bool().unwrap_or(false),
          _ => false,
        };
        match state.entries.iter_mut().find(|e| e.id.to_string() == *id) {
          Some(entry) => {
            entry.public = public;
            Response::new(200, "")
          }
          None => Response::new(404, "no such entry"),
        }
      }
      (Method::Get, ["entries", user]) if *user == self.username => {
        if state.entries.is_empty() {
          Response::new(204, "")
        } else {
          let list: Vec<_> = state.entries.iter().map(|e| self.entry_json(e)).collect();
          Response::new(200, serde_json::Value::Array(list).to_string())
            .with_header("content-type", "application/json")
        }
      }
      _ => Response::new(404, "unknown route"),
    };

    Ok(response)
  }
}
