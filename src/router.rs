//! Request router: classifies each request and runs its caching strategy.
//!
//! Classification, first match wins:
//! 1. non-GET → network only, no cache involvement
//! 2. bypassed host → straight to network
//! 3. app shell (root, `.html`, bundle prefixes) → network-first, shell partition
//! 4. API prefix → network-first, API partition
//! 5. image extension or image destination → cache-first, image partition
//! 6. anything else → stale-while-revalidate, shell partition

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::{CachedResponse, PartitionName, Purpose, ResponseCache};
use crate::config::RoutingConfig;
use crate::error::{Result, SyncError};
use crate::http::{Destination, Method, Request, RequestIdentity, Response, Transport};

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  NetworkOnly,
  Passthrough,
  NetworkFirst(Purpose),
  CacheFirst(Purpose),
  StaleWhileRevalidate(Purpose),
}

/// Indicates where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from cache by design (cache-first or stale-while-revalidate)
  Cache,
  /// Network failed or was rejected, cached copy served instead
  CacheFallback,
  /// Bypassed host, never touches the cache
  Passthrough,
}

/// Response plus metadata about its source.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
  pub response: Response,
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl RoutedResponse {
  fn network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  fn cached(cached: CachedResponse, source: ResponseSource) -> Self {
    Self {
      response: cached.response,
      source,
      cached_at: Some(cached.stored_at),
    }
  }

  pub fn is_from_cache(&self) -> bool {
    matches!(
      self.source,
      ResponseSource::Cache | ResponseSource::CacheFallback
    )
  }
}

pub struct Router {
  cache: Arc<ResponseCache>,
  transport: Arc<dyn Transport>,
  rules: RoutingConfig,
  version: watch::Receiver<String>,
  timeout: Duration,
  revalidations: Mutex<JoinSet<()>>,
}

impl Router {
  pub fn new(
    cache: Arc<ResponseCache>,
    transport: Arc<dyn Transport>,
    rules: RoutingConfig,
    version: watch::Receiver<String>,
    timeout: Duration,
  ) -> Self {
    Self {
      cache,
      transport,
      rules,
      version,
      timeout,
      revalidations: Mutex::new(JoinSet::new()),
    }
  }

  /// Pick the strategy for `request` without running it.
  pub fn classify(&self, request: &Request) -> Strategy {
    if request.method != Method::Get {
      return Strategy::NetworkOnly;
    }

    let url = &request.url;
    if let Some(host) = url.host_str() {
      let host = host.to_lowercase();
      let bypassed = self
        .rules
        .bypass_hosts
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{}", h)));
      if bypassed {
        return Strategy::Passthrough;
      }
    }

    let path = url.path();
    let is_shell = path == "/"
      || path.ends_with(".html")
      || self.rules.shell_prefixes.iter().any(|p| path.starts_with(p.as_str()));
    if is_shell {
      return Strategy::NetworkFirst(Purpose::StaticShell);
    }

    if path.starts_with(self.rules.api_prefix.as_str()) {
      return Strategy::NetworkFirst(Purpose::ApiData);
    }

    let is_image = request.destination == Some(Destination::Image)
      || path
        .rsplit_once('.')
        .map(|(_, ext)| {
          let ext = ext.to_lowercase();
          self.rules.image_extensions.iter().any(|e| *e == ext)
        })
        .unwrap_or(false);
    if is_image {
      return Strategy::CacheFirst(Purpose::ImageAsset);
    }

    Strategy::StaleWhileRevalidate(Purpose::StaticShell)
  }

  /// Serve `request` with its strategy.
  pub async fn handle(&self, request: Request) -> Result<RoutedResponse> {
    let strategy = self.classify(&request);
    debug!(url = %request.url, ?strategy, "routing request");

    match strategy {
      Strategy::NetworkOnly => Ok(RoutedResponse::network(self.transport.send(&request).await?)),
      Strategy::Passthrough => Ok(RoutedResponse {
        response: self.transport.send(&request).await?,
        source: ResponseSource::Passthrough,
        cached_at: None,
      }),
      Strategy::NetworkFirst(purpose) => self.network_first(request, purpose).await,
      Strategy::CacheFirst(purpose) => self.cache_first(request, purpose).await,
      Strategy::StaleWhileRevalidate(purpose) => self.stale_while_revalidate(request, purpose).await,
    }
  }

  /// Wait for every background revalidation started so far.
  pub async fn settle(&self) {
    let mut pending = match self.revalidations.lock() {
      Ok(mut set) => std::mem::take(&mut *set),
      Err(_) => return,
    };
    while pending.join_next().await.is_some() {}
  }

  fn partition(&self, purpose: Purpose) -> PartitionName {
    PartitionName::new(purpose, self.version.borrow().clone())
  }

  fn identity(request: &Request) -> Result<RequestIdentity> {
    request
      .identity()
      .ok_or_else(|| SyncError::InvalidRequest(format!("{} is not cacheable", request.url)))
  }

  async fn send_with_timeout(&self, request: &Request) -> Result<Response> {
    match tokio::time::timeout(self.timeout, self.transport.send(request)).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::NetworkUnreachable(format!(
        "{} timed out after {:?}",
        request.url, self.timeout
      ))),
    }
  }

  async fn network_first(&self, request: Request, purpose: Purpose) -> Result<RoutedResponse> {
    let identity = Self::identity(&request)?;
    let partition = self.partition(purpose);

    match self.send_with_timeout(&request).await {
      Ok(response) if response.is_success() => {
        store_quietly(&self.cache, &partition, &identity, &response);
        Ok(RoutedResponse::network(response))
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "network rejected, trying cache");
        match lookup_quietly(&self.cache, &partition, &identity) {
          Some(cached) => Ok(RoutedResponse::cached(cached, ResponseSource::CacheFallback)),
          // Error responses pass through uncached.
          None => Ok(RoutedResponse::network(response)),
        }
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network failed, trying cache");
        match lookup_quietly(&self.cache, &partition, &identity) {
          Some(cached) => Ok(RoutedResponse::cached(cached, ResponseSource::CacheFallback)),
          None => Err(SyncError::NoResponse(request.url.to_string())),
        }
      }
    }
  }

  async fn cache_first(&self, request: Request, purpose: Purpose) -> Result<RoutedResponse> {
    let identity = Self::identity(&request)?;
    let partition = self.partition(purpose);

    if let Some(cached) = lookup_quietly(&self.cache, &partition, &identity) {
      return Ok(RoutedResponse::cached(cached, ResponseSource::Cache));
    }

    let response = self.send_with_timeout(&request).await?;
    store_quietly(&self.cache, &partition, &identity, &response);
    Ok(RoutedResponse::network(response))
  }

  async fn stale_while_revalidate(
    &self,
    request: Request,
    purpose: Purpose,
  ) -> Result<RoutedResponse> {
    let identity = Self::identity(&request)?;
    let partition = self.partition(purpose);

    let Some(cached) = lookup_quietly(&self.cache, &partition, &identity) else {
      let response = self.send_with_timeout(&request).await?;
      store_quietly(&self.cache, &partition, &identity, &response);
      return Ok(RoutedResponse::network(response));
    };

    let cache = Arc::clone(&self.cache);
    let transport = Arc::clone(&self.transport);
    let timeout = self.timeout;
    let refresh = async move {
      match tokio::time::timeout(timeout, transport.send(&request)).await {
        Ok(Ok(response)) => store_quietly(&cache, &partition, &identity, &response),
        Ok(Err(e)) => debug!(url = %request.url, error = %e, "revalidation failed"),
        Err(_) => debug!(url = %request.url, "revalidation timed out"),
      }
    };

    match self.revalidations.lock() {
      Ok(mut set) => {
        while set.try_join_next().is_some() {}
        set.spawn(refresh);
      }
      Err(_) => warn!("revalidation set poisoned, skipping refresh"),
    }

    Ok(RoutedResponse::cached(cached, ResponseSource::Cache))
  }
}

/// Cache read where any failure counts as a miss.
fn lookup_quietly(
  cache: &ResponseCache,
  partition: &PartitionName,
  identity: &RequestIdentity,
) -> Option<CachedResponse> {
  match cache.lookup(partition, identity) {
    Ok(hit) => hit,
    Err(e) => {
      warn!(partition = %partition, error = %e, "cache lookup failed, treating as miss");
      None
    }
  }
}

/// Cache write where failure is logged and dropped. Non-2xx responses are skipped.
fn store_quietly(
  cache: &ResponseCache,
  partition: &PartitionName,
  identity: &RequestIdentity,
  response: &Response,
) {
  if let Err(e) = cache.store(partition, identity, response) {
    warn!(partition = %partition, error = %e, "cache store failed");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::ScriptedTransport;

  struct Fixture {
    router: Router,
    cache: Arc<ResponseCache>,
    transport: Arc<ScriptedTransport>,
    _version: watch::Sender<String>,
  }

  fn fixture(timeout: Duration) -> Fixture {
    let cache = Arc::new(ResponseCache::open_in_memory().unwrap());
    let transport = Arc::new(ScriptedTransport::new());
    let (tx, rx) = watch::channel("v1".to_string());
    let router = Router::new(
      Arc::clone(&cache),
      transport.clone(),
      RoutingConfig::default(),
      rx,
      timeout,
    );
    Fixture {
      router,
      cache,
      transport,
      _version: tx,
    }
  }

  fn get(url: &str) -> Request {
    Request::get(url).unwrap()
  }

  #[test]
  fn test_classification_order() {
    let f = fixture(Duration::from_secs(1));
    let r = &f.router;

    let post = Request::new(Method::Post, "https://api.test/japp/create").unwrap();
    assert_eq!(r.classify(&post), Strategy::NetworkOnly);
    assert_eq!(
      r.classify(&get("https://open.spotify.com/embed/track/1.png")),
      Strategy::Passthrough
    );
    assert_eq!(
      r.classify(&get("https://app.test/")),
      Strategy::NetworkFirst(Purpose::StaticShell)
    );
    assert_eq!(
      r.classify(&get("https://app.test/about.html")),
      Strategy::NetworkFirst(Purpose::StaticShell)
    );
    assert_eq!(
      r.classify(&get("https://app.test/static/js/main.abc.js")),
      Strategy::NetworkFirst(Purpose::StaticShell)
    );
    assert_eq!(
      r.classify(&get("https://api.test/japp/entries/alice")),
      Strategy::NetworkFirst(Purpose::ApiData)
    );
    assert_eq!(
      r.classify(&get("https://img.test/uploads/cat.JPG")),
      Strategy::CacheFirst(Purpose::ImageAsset)
    );
    assert_eq!(
      r.classify(&get("https://img.test/render?id=4").with_destination(Destination::Image)),
      Strategy::CacheFirst(Purpose::ImageAsset)
    );
    assert_eq!(
      r.classify(&get("https://app.test/manifest.json")),
      Strategy::StaleWhileRevalidate(Purpose::StaticShell)
    );
  }

  #[tokio::test]
  async fn test_cached_image_never_touches_network() {
    let f = fixture(Duration::from_secs(1));
    let url = "https://img.test/uploads/cat.png";
    let partition = PartitionName::new(Purpose::ImageAsset, "v1");
    f.cache
      .store(&partition, &get(url).identity().unwrap(), &Response::new(200, "png"))
      .unwrap();

    let routed = f.router.handle(get(url)).await.unwrap();
    assert_eq!(routed.source, ResponseSource::Cache);
    assert_eq!(&routed.response.body[..], b"png");
    assert_eq!(f.transport.call_count(), 0);
  }

  #[tokio::test]
  async fn test_image_miss_fetches_and_stores_success_only() {
    let f = fixture(Duration::from_secs(1));
    f.transport
      .respond(Method::Get, "https://img.test/a.png", Response::new(200, "a"));
    f.transport
      .respond(Method::Get, "https://img.test/b.png", Response::new(404, "gone"));

    assert_eq!(
      f.router.handle(get("https://img.test/a.png")).await.unwrap().source,
      ResponseSource::Network
    );
    assert_eq!(
      f.router.handle(get("https://img.test/a.png")).await.unwrap().source,
      ResponseSource::Cache
    );

    let missing = f.router.handle(get("https://img.test/b.png")).await.unwrap();
    assert_eq!(missing.response.status, 404);
    f.router.handle(get("https://img.test/b.png")).await.unwrap();
    assert_eq!(f.transport.call_count(), 3);
  }

  #[tokio::test]
  async fn test_api_response_cached_then_served_offline() {
    let f = fixture(Duration::from_secs(1));
    let url = "https://api.test/japp/entries/alice";
    f.transport
      .respond(Method::Get, url, Response::new(200, r#"[{"id":"1"}]"#));

    let online = f.router.handle(get(url)).await.unwrap();
    assert_eq!(online.source, ResponseSource::Network);

    f.transport.set_offline(true);
    let offline = f.router.handle(get(url)).await.unwrap();
    assert_eq!(offline.source, ResponseSource::CacheFallback);
    assert_eq!(&offline.response.body[..], br#"[{"id":"1"}]"#);
  }

  #[tokio::test]
  async fn test_api_error_passes_through_uncached() {
    let f = fixture(Duration::from_secs(1));
    let url = "https://api.test/japp/entries/bob";
    f.transport.respond(Method::Get, url, Response::new(500, "oops"));

    let routed = f.router.handle(get(url)).await.unwrap();
    assert_eq!(routed.response.status, 500);
    let partition = PartitionName::new(Purpose::ApiData, "v1");
    assert_eq!(f.cache.entry_count(&partition).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_rejected_network_falls_back_to_cache() {
    let f = fixture(Duration::from_secs(1));
    let url = "https://api.test/japp/entries/alice";
    f.transport.respond_once(Method::Get, url, Response::new(200, "old"));
    f.transport.respond(Method::Get, url, Response::new(503, "down"));

    f.router.handle(get(url)).await.unwrap();
    let routed = f.router.handle(get(url)).await.unwrap();
    assert_eq!(routed.source, ResponseSource::CacheFallback);
    assert_eq!(&routed.response.body[..], b"old");
  }

  #[tokio::test]
  async fn test_network_and_cache_both_failing_is_well_defined() {
    let f = fixture(Duration::from_secs(1));
    f.transport.set_offline(true);
    let err = f.router.handle(get("https://app.test/")).await.unwrap_err();
    assert!(matches!(err, SyncError::NoResponse(_)));
  }

  #[tokio::test]
  async fn test_hung_network_times_out_to_cache() {
    let f = fixture(Duration::from_millis(50));
    let url = "https://app.test/index.html";
    let partition = PartitionName::new(Purpose::StaticShell, "v1");
    f.cache
      .store(&partition, &get(url).identity().unwrap(), &Response::new(200, "shell"))
      .unwrap();
    f.transport.hang(Method::Get, url);

    let routed = f.router.handle(get(url)).await.unwrap();
    assert_eq!(routed.source, ResponseSource::CacheFallback);
    assert_eq!(&routed.response.body[..], b"shell");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_cache_then_refreshes() {
    let f = fixture(Duration::from_secs(1));
    let url = "https://app.test/manifest.json";
    let partition = PartitionName::new(Purpose::StaticShell, "v1");
    let identity = get(url).identity().unwrap();
    f.cache
      .store(&partition, &identity, &Response::new(200, "stale"))
      .unwrap();
    f.transport.respond(Method::Get, url, Response::new(200, "fresh"));

    let routed = f.router.handle(get(url)).await.unwrap();
    assert_eq!(routed.source, ResponseSource::Cache);
    assert_eq!(&routed.response.body[..], b"stale");

    f.router.settle().await;
    let stored = f.cache.lookup(&partition, &identity).unwrap().unwrap();
    assert_eq!(&stored.response.body[..], b"fresh");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_awaits_network() {
    let f = fixture(Duration::from_secs(1));
    let url = "https://app.test/logo.txt";
    f.transport.respond(Method::Get, url, Response::new(200, "txt"));

    let routed = f.router.handle(get(url)).await.unwrap();
    assert_eq!(routed.source, ResponseSource::Network);
    assert_eq!(f.transport.call_count(), 1);
  }

  #[tokio::test]
  async fn test_passthrough_and_mutations_skip_cache() {
    let f = fixture(Duration::from_secs(1));
    let embed = "https://open.spotify.com/embed/track/9";
    f.transport.respond(Method::Get, embed, Response::new(200, "embed"));
    let routed = f.router.handle(get(embed)).await.unwrap();
    assert_eq!(routed.source, ResponseSource::Passthrough);

    let delete = Request::delete("https://api.test/japp/entries/1").unwrap();
    f.transport
      .respond(Method::Delete, "https://api.test/japp/entries/1", Response::new(200, ""));
    f.router.handle(delete).await.unwrap();

    assert!(f.cache.partition_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_version_change_switches_partitions() {
    let f = fixture(Duration::from_secs(1));
    let url = "https://img.test/x.png";
    f.transport.respond(Method::Get, url, Response::new(200, "x"));
    f.router.handle(get(url)).await.unwrap();

    f._version.send("v2".to_string()).unwrap();
    assert_eq!(
      f.router.handle(get(url)).await.unwrap().source,
      ResponseSource::Network
    );
    assert_eq!(
      f.cache
        .entry_count(&PartitionName::new(Purpose::ImageAsset, "v2"))
        .unwrap(),
      1
    );
  }
}
