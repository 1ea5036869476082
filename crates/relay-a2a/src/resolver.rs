//! Agent card resolver: fetches and caches discovery documents
//!
//! Cards are cached per endpoint base for a fixed time-to-live. Each endpoint
//! owns a slot guarded by an async mutex, so concurrent resolutions of the same
//! endpoint collapse into one upstream fetch while unrelated endpoints proceed
//! independently. The slot table itself is a bounded LRU.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{RelayError, Result};
use crate::protocol::{AGENT_CARD_PATH, AgentCard, LEGACY_AGENT_CARD_PATH};

pub const DEFAULT_CARD_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

struct CachedCard {
    card: Arc<AgentCard>,
    fetched_at: Instant,
}

type Slot = Arc<tokio::sync::Mutex<Option<CachedCard>>>;

pub struct CardResolver {
    http: Client,
    ttl: Duration,
    slots: Mutex<LruCache<String, Slot>>,
}

impl CardResolver {
    pub fn new(http: Client, ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            http,
            ttl,
            slots: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Resolver with its own HTTP client and default cache policy
    pub fn with_defaults() -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RelayError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::new(http, DEFAULT_CARD_TTL, DEFAULT_CACHE_CAPACITY))
    }

    /// Resolve the card published under `endpoint_base`.
    ///
    /// A fresh cached card is returned as-is; a stale or missing one is
    /// fetched while holding the endpoint's slot.
    pub async fn resolve(&self, endpoint_base: &str) -> Result<Arc<AgentCard>> {
        let base = normalize_base(endpoint_base)?;
        let slot = self.slot(base.as_str());
        let mut cached = slot.lock().await;

        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.card.clone());
            }
            debug!("Agent card for {} is stale, refreshing", base);
        }

        let card = Arc::new(self.fetch(&base).await?);
        *cached = Some(CachedCard {
            card: card.clone(),
            fetched_at: Instant::now(),
        });
        Ok(card)
    }

    /// Drop the cached card for `endpoint_base`; the next resolve refetches.
    pub fn invalidate(&self, endpoint_base: &str) {
        if let Ok(base) = normalize_base(endpoint_base) {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.pop(base.as_str()).is_some() {
                debug!("Invalidated agent card cache for {}", base);
            }
        }
    }

    pub fn cached_endpoints(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get_or_insert(key.to_string(), || Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    async fn fetch(&self, base: &Url) -> Result<AgentCard> {
        let body = match self.fetch_document(base, AGENT_CARD_PATH).await? {
            Some(body) => body,
            None => self
                .fetch_document(base, LEGACY_AGENT_CARD_PATH)
                .await?
                .ok_or_else(|| unavailable(base, "no discovery document (HTTP 404)"))?,
        };

        let card: AgentCard = serde_json::from_value(body)
            .map_err(|e| RelayError::InvalidCard(format!("{} ({})", e, base)))?;
        card.validate()?;

        info!(
            "Resolved agent card: {} v{} ({} skills, streaming: {})",
            card.name,
            card.version,
            card.skills.len(),
            card.capabilities.streaming
        );
        Ok(card)
    }

    /// `Ok(None)` on 404 so the caller can fall back to the legacy path.
    async fn fetch_document(&self, base: &Url, path: &str) -> Result<Option<Value>> {
        let url = base
            .join(path)
            .map_err(|e| unavailable(base, &e.to_string()))?;
        debug!("Fetching agent card from {}", url);

        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| unavailable(base, &format!("failed to connect: {}", e)))?;

        if resp.status() == StatusCode::NOT_FOUND {
            warn!("No agent card at {}", url);
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(unavailable(base, &format!("HTTP {}", resp.status())));
        }

        let body = resp
            .json::<Value>()
            .await
            .map_err(|e| unavailable(base, &format!("malformed document: {}", e)))?;
        Ok(Some(body))
    }
}

fn unavailable(base: &Url, reason: &str) -> RelayError {
    RelayError::DiscoveryUnavailable {
        endpoint: base.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse an endpoint base and make it a directory so relative joins keep
/// path-mounted prefixes (`.../invocations/`).
pub fn normalize_base(endpoint_base: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint_base.trim()).map_err(|e| RelayError::DiscoveryUnavailable {
        endpoint: endpoint_base.to_string(),
        reason: format!("invalid endpoint URL: {}", e),
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn card_body(url: &str) -> Value {
        json!({
            "name": "OpsRemediation_Agent",
            "version": "0.3.0",
            "url": url,
            "preferredTransport": "JSONRPC",
            "capabilities": {"streaming": true},
            "skills": [],
            "defaultInputModes": ["text"],
            "defaultOutputModes": ["text"]
        })
    }

    fn resolver(ttl: Duration) -> CardResolver {
        CardResolver::new(Client::new(), ttl, 8)
    }

    #[test]
    fn test_normalize_base_adds_trailing_slash() {
        let url = normalize_base("http://127.0.0.1:9000/runtimes/abc/invocations").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/runtimes/abc/invocations/");
        assert_eq!(
            url.join(AGENT_CARD_PATH).unwrap().path(),
            "/runtimes/abc/invocations/.well-known/agent-card.json"
        );
        assert!(normalize_base("not a url").is_err());
    }

    #[tokio::test]
    async fn test_resolve_twice_fetches_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/agent-card.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(card_body(&server.uri())))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver(Duration::from_secs(60));
        let first = resolver.resolve(&server.uri()).await.unwrap();
        let second = resolver.resolve(&server.uri()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name, "OpsRemediation_Agent");
    }

    #[tokio::test]
    async fn test_concurrent_resolves_collapse_into_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/agent-card.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(card_body(&server.uri()))
                    .set_delay(Duration::from_millis(150)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolver = Arc::new(resolver(Duration::from_secs(60)));
        let uri = server.uri();
        let (a, b) = tokio::join!(resolver.resolve(&uri), resolver.resolve(&uri));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_stale_card_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/agent-card.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(card_body(&server.uri())))
            .expect(2)
            .mount(&server)
            .await;

        let resolver = resolver(Duration::from_millis(20));
        resolver.resolve(&server.uri()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        resolver.resolve(&server.uri()).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/agent-card.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(card_body(&server.uri())))
            .expect(2)
            .mount(&server)
            .await;

        let resolver = resolver(Duration::from_secs(60));
        resolver.resolve(&server.uri()).await.unwrap();
        resolver.invalidate(&server.uri());
        assert_eq!(resolver.cached_endpoints(), 0);
        resolver.resolve(&server.uri()).await.unwrap();
    }

    #[tokio::test]
    async fn test_falls_back_to_legacy_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/agents/ops/.well-known/agent-card.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/agents/ops/.well-known/agent.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(card_body(&server.uri())))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver(Duration::from_secs(60));
        let base = format!("{}/agents/ops", server.uri());
        let card = resolver.resolve(&base).await.unwrap();
        assert_eq!(card.version, "0.3.0");
    }

    #[tokio::test]
    async fn test_missing_document_is_discovery_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = resolver(Duration::from_secs(60))
            .resolve(&server.uri())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DiscoveryUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_malformed_document_is_discovery_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/agent-card.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let err = resolver(Duration::from_secs(60))
            .resolve(&server.uri())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DiscoveryUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_card_without_transport_is_invalid() {
        let server = MockServer::start().await;
        let mut body = card_body(&server.uri());
        body.as_object_mut().unwrap().remove("preferredTransport");
        Mock::given(method("GET"))
            .and(path("/.well-known/agent-card.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let resolver = resolver(Duration::from_secs(60));
        let err = resolver.resolve(&server.uri()).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidCard(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_discovery_unavailable() {
        let err = resolver(Duration::from_secs(60))
            .resolve("http://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DiscoveryUnavailable { .. }));
        assert!(err.to_string().contains("127.0.0.1"));
    }
}
