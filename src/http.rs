//! HTTP value types and the transport seam the router and reconciler send through.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Result, SyncError};
use crate::model::Attachment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
  Empty,
  Json(serde_json::Value),
  /// A JSON part plus an optional binary file part
  Multipart {
    json_part: String,
    json: serde_json::Value,
    file_part: String,
    file: Option<Attachment>,
  },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Option<Destination>,
  pub body: RequestBody,
}

impl Request {
  pub fn new(method: Method, url: &str) -> Result<Self> {
    let url =
      Url::parse(url).map_err(|e| SyncError::InvalidRequest(format!("{}: {}", url, e)))?;
    Ok(Self {
      method,
      url,
      destination: None,
      body: RequestBody::Empty,
    })
  }

  pub fn get(url: &str) -> Result<Self> {
    Self::new(Method::Get, url)
  }

  pub fn delete(url: &str) -> Result<Self> {
    Self::new(Method::Delete, url)
  }

  pub fn put_json(url: &str, body: serde_json::Value) -> Result<Self> {
    Ok(Self::new(Method::Put, url)?.with_body(RequestBody::Json(body)))
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = Some(destination);
    self
  }

  pub fn with_body(mut self, body: RequestBody) -> Self {
    self.body = body;
    self
  }

  /// Cache identity of this request. Only GET requests have one.
  pub fn identity(&self) -> Option<RequestIdentity> {
    (self.method == Method::Get).then(|| RequestIdentity::for_get(&self.url))
  }
}

/// Normalized method + URL used as the cache key for a GET request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  normalized: String,
}

impl RequestIdentity {
  pub fn for_get(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      normalized: format!("GET {}", url),
    }
  }

  pub fn as_str(&self) -> &str {
    &self.normalized
  }

  /// SHA256 hash for stable, fixed-length keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.normalized.as_bytes());
    hex::encode(hasher.finalize())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  /// Refcounted, so handing one copy to the cache and one to the caller is cheap.
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    Ok(serde_json::from_slice(&self.body)?)
  }

  /// Turn a non-2xx response into `RemoteRejected`.
  pub fn error_for_status(self, request: &Request) -> Result<Self> {
    if self.is_success() {
      Ok(self)
    } else {
      Err(SyncError::RemoteRejected {
        method: request.method.as_str().to_string(),
        url: request.url.to_string(),
        status: self.status,
      })
    }
  }
}

/// Sends requests to the network.
///
/// Implementations return `Ok` for any HTTP response, including error
/// statuses, and `NetworkUnreachable` only when no response arrived.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &Request) -> Result<Response>;
}

/// Transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("lanesync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| SyncError::NetworkUnreachable(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self { client, token })
  }

  fn build(&self, request: &Request) -> Result<reqwest::RequestBuilder> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, request.url.clone());
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }

    let builder = match &request.body {
      RequestBody::Empty => builder,
      RequestBody::Json(value) => builder.json(value),
      RequestBody::Multipart {
        json_part,
        json,
        file_part,
        file,
      } => {
        let json_bytes = serde_json::to_vec(json)?;
        let mut form = reqwest::multipart::Form::new().part(
          json_part.clone(),
          reqwest::multipart::Part::bytes(json_bytes)
            .mime_str("application/json")
            .map_err(|e| SyncError::InvalidRequest(e.to_string()))?,
        );
        if let Some(file) = file {
          let part = reqwest::multipart::Part::bytes(file.data.to_vec())
            .file_name(file.file_name.clone())
            .mime_str(&file.content_type)
            .map_err(|e| SyncError::InvalidRequest(e.to_string()))?;
          form = form.part(file_part.clone(), part);
        }
        builder.multipart(form)
      }
    };

    Ok(builder)
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &Request) -> Result<Response> {
    let response = self
      .build(request)?
      .send()
      .await
      .map_err(|e| SyncError::NetworkUnreachable(format!("{} {}: {}", request.method.as_str(), request.url, e)))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| SyncError::NetworkUnreachable(format!("Failed to read body of {}: {}", request.url, e)))?;

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
