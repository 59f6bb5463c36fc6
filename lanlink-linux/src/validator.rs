//! Endpoint validation probe: `GET /api/tags`, collapsed to a bool.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use lanlink_core::probe::{is_model_listing, probe_url};
use lanlink_core::{CachePolicy, EndpointKey, ProbePolicy, ServiceEndpoint};
use parking_lot::Mutex;
use tokio::time::Instant;

/// How long a cached probe result may be reused under [`CachePolicy::PreferCache`].
pub const RESULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Largest `/api/tags` body read before the endpoint is rejected.
pub const MAX_PROBE_BODY: usize = 1 << 20;

/// Never fails: every error is a negative result.
#[async_trait]
pub trait EndpointValidator: Send + Sync {
    async fn validate(&self, endpoint: &ServiceEndpoint, probe: ProbePolicy) -> bool;
}

pub struct HttpValidator {
    client: reqwest::Client,
    results: Mutex<HashMap<EndpointKey, (Instant, bool)>>,
}

impl HttpValidator {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            results: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &EndpointKey) -> Option<bool> {
        let results = self.results.lock();
        results
            .get(key)
            .filter(|(at, _)| at.elapsed() < RESULT_CACHE_TTL)
            .map(|(_, ok)| *ok)
    }

    async fn probe(&self, endpoint: &ServiceEndpoint, probe: ProbePolicy) -> Result<bool, reqwest::Error> {
        let mut req = self
            .client
            .get(probe_url(&endpoint.base_url()))
            .timeout(probe.timeout);
        if probe.cache == CachePolicy::ReloadIgnoringCache {
            req = req.header(reqwest::header::CACHE_CONTROL, "no-cache");
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        match read_capped(resp).await? {
            Some(body) => Ok(is_model_listing(status, &body)),
            None => {
                tracing::debug!(endpoint = %endpoint.key(), "probe body over limit");
                Ok(false)
            }
        }
    }
}

/// `None` once the body exceeds [`MAX_PROBE_BODY`].
async fn read_capped(mut resp: reqwest::Response) -> Result<Option<Vec<u8>>, reqwest::Error> {
    if resp.content_length().is_some_and(|n| n > MAX_PROBE_BODY as u64) {
        return Ok(None);
    }
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        if body.len() + chunk.len() > MAX_PROBE_BODY {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

#[async_trait]
impl EndpointValidator for HttpValidator {
    async fn validate(&self, endpoint: &ServiceEndpoint, probe: ProbePolicy) -> bool {
        let key = endpoint.key();
        if probe.cache == CachePolicy::PreferCache {
            if let Some(ok) = self.cached(&key) {
                tracing::debug!(endpoint = %key, ok, "probe result from cache");
                return ok;
            }
        }
        let ok = match self.probe(endpoint, probe).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(endpoint = %key, error = %e, "probe failed");
                false
            }
        };
        self.results.lock().insert(key, (Instant::now(), ok));
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestServer;
    use tokio::net::TcpListener;

    fn endpoint(server: &TestServer) -> ServiceEndpoint {
        ServiceEndpoint::from_addr("test", server.addr.ip(), server.addr.port())
    }

    const TAGS_OK: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 13\r\nConnection: close\r\n\r\n{\"models\":[]}";
    const WRONG_SHAPE: &str = "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"data\":[]}";
    const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    #[tokio::test]
    async fn accepts_ollama_listing() {
        let server = TestServer::start(TAGS_OK).await;
        let v = HttpValidator::new().unwrap();
        assert!(v.validate(&endpoint(&server), ProbePolicy::default()).await);
        let req = &server.requests()[0];
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/api/tags");
        assert_eq!(req.header("cache-control"), Some("no-cache"));
    }

    #[tokio::test]
    async fn rejects_wrong_shape_and_status() {
        let v = HttpValidator::new().unwrap();
        let server = TestServer::start(WRONG_SHAPE).await;
        assert!(!v.validate(&endpoint(&server), ProbePolicy::default()).await);
        let server = TestServer::start(NOT_FOUND).await;
        assert!(!v.validate(&endpoint(&server), ProbePolicy::default()).await);
    }

    #[tokio::test]
    async fn oversized_listing_is_rejected() {
        let declared = "HTTP/1.1 200 OK\r\nContent-Length: 4194304\r\nConnection: close\r\n\r\n{\"models\":[]}";
        let server = TestServer::start(declared).await;
        let v = HttpValidator::new().unwrap();
        assert!(!v.validate(&endpoint(&server), ProbePolicy::default()).await);

        // No length given; valid JSON padded past the cap with whitespace.
        let padded = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n{{\"models\":[{}]}}",
            " ".repeat(MAX_PROBE_BODY)
        );
        let server = TestServer::start(Box::leak(padded.into_boxed_str())).await;
        assert!(!v.validate(&endpoint(&server), ProbePolicy::default()).await);
    }

    #[tokio::test]
    async fn connection_refused_is_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let v = HttpValidator::new().unwrap();
        let ep = ServiceEndpoint::new("gone", "127.0.0.1", port);
        assert!(!v.validate(&ep, ProbePolicy::default()).await);
    }

    #[tokio::test]
    async fn timeout_is_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let v = HttpValidator::new().unwrap();
        let ep = ServiceEndpoint::new("slow", "127.0.0.1", addr.port());
        let probe = ProbePolicy {
            timeout: Duration::from_millis(200),
            cache: CachePolicy::ReloadIgnoringCache,
        };
        assert!(!v.validate(&ep, probe).await);
    }

    #[tokio::test]
    async fn prefer_cache_reuses_result() {
        let server = TestServer::start(TAGS_OK).await;
        let v = HttpValidator::new().unwrap();
        let cached = ProbePolicy {
            timeout: Duration::from_millis(1500),
            cache: CachePolicy::PreferCache,
        };
        assert!(v.validate(&endpoint(&server), cached).await);
        assert!(v.validate(&endpoint(&server), cached).await);
        assert_eq!(server.hits(), 1);
        assert_eq!(server.requests()[0].header("cache-control"), None);

        assert!(v.validate(&endpoint(&server), ProbePolicy::default()).await);
        assert_eq!(server.hits(), 2);
    }
}
