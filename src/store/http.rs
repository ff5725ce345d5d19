//! REST document store.
//!
//! Documents are plain JSON resources under a base URL:
//! - `GET {base_url}/{path}` returns the document, 404 when it does not exist
//! - `PUT {base_url}/{path}` replaces it
//!
//! Subscriptions poll the resource and publish only when the content
//! changed. Writes made through this store are published to local
//! subscribers immediately, without waiting for the next poll.
//!
//! Transport errors, 429 and 5xx responses are retried with exponential
//! backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DocumentPath, DocumentStore, Subscription, WatchHub};
use crate::{CatalogError, Result};

// Retry backoff: 500ms, 1s, 2s, ...
const BACKOFF_BASE_MS: u64 = 500;
const MAX_BACKOFF_SHIFT: u32 = 5;

/// Configuration for [`HttpStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpStoreConfig {
    pub base_url: String,
    /// Sent as HTTP Basic credentials `API_KEY:{key}`
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            poll_interval_ms: 2_000,
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

/// Request sender shared between the store and its poll tasks.
#[derive(Clone)]
struct Transport {
    client: Client,
    auth_header: Option<String>,
    max_retries: u32,
}

impl Transport {
    async fn get(&self, url: &str) -> Result<Option<Value>> {
        let resp = self.send(|| self.client.get(url)).await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = ensure_success(resp)?;

        match resp.json::<Value>().await? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    async fn put(&self, url: &str, payload: &Value) -> Result<()> {
        let resp = self.send(|| self.client.put(url).json(payload)).await?;
        ensure_success(resp)?;
        Ok(())
    }

    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;

        loop {
            let mut request = build();
            if let Some(auth) = &self.auth_header {
                request = request.header("Authorization", auth);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable {
                        return Ok(resp);
                    }

                    retries += 1;
                    if retries > self.max_retries {
                        return Err(CatalogError::Http {
                            message: format!("max retries exceeded ({})", status),
                            status_code: Some(status.as_u16()),
                        });
                    }
                    let backoff = backoff(retries);
                    warn!(
                        "[HttpStore] {} from {}, retry {} after {:?}",
                        status,
                        resp.url(),
                        retries,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Err(e.into());
                    }
                    let backoff = backoff(retries);
                    warn!(
                        "[HttpStore] Request error: {}, retry {} after {:?}",
                        e, retries, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn backoff(retries: u32) -> Duration {
    Duration::from_millis(BACKOFF_BASE_MS << retries.saturating_sub(1).min(MAX_BACKOFF_SHIFT))
}

fn ensure_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(CatalogError::Http {
            message: format!("HTTP {} for {}", status, resp.url()),
            status_code: Some(status.as_u16()),
        })
    }
}

fn basic_auth(api_key: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", api_key));
    format!("Basic {}", encoded)
}

/// Document store backed by a REST endpoint.
pub struct HttpStore {
    transport: Transport,
    base_url: String,
    poll_interval: Duration,
    hub: Arc<WatchHub>,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CatalogError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                status_code: None,
            })?;

        info!("[HttpStore] Using {}", config.base_url);

        Ok(Self {
            transport: Transport {
                client,
                auth_header: config.api_key.as_deref().map(basic_auth),
                max_retries: config.max_retries,
            },
            base_url: config.base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            hub: Arc::new(WatchHub::new()),
        })
    }

    fn url(&self, path: &DocumentPath) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn read(&self, path: &DocumentPath) -> Result<Option<Value>> {
        self.transport.get(&self.url(path)).await
    }

    async fn write(&self, path: &DocumentPath, payload: Value) -> Result<()> {
        self.transport.put(&self.url(path), &payload).await?;
        debug!("[HttpStore] write {}", path);
        self.hub.publish(path, Some(payload));
        Ok(())
    }

    async fn subscribe(&self, path: &DocumentPath) -> Result<Subscription> {
        let current = self.read(path).await?;
        let receiver = self.hub.subscribe(path, current.clone());
        self.hub.publish_if_changed(path, current);

        let transport = self.transport.clone();
        let hub = Arc::clone(&self.hub);
        let url = self.url(path);
        let path = path.clone();
        let interval = self.poll_interval;

        let feeder = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match transport.get(&url).await {
                    Ok(content) => {
                        if hub.publish_if_changed(&path, content) {
                            debug!("[HttpStore] change detected at {}", path);
                        }
                    }
                    Err(e) => warn!("[HttpStore] poll of {} failed: {}", path, e),
                }
            }
        });

        Ok(Subscription::with_feeder(receiver, feeder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Local HTTP/1.1 server answering with canned responses.
    struct StubServer {
        base_url: String,
        hits: Arc<AtomicUsize>,
        /// (method, body) of every request received
        requests: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl StubServer {
        /// `respond(n, method)` gives the status and body for the n-th request.
        async fn start<F>(respond: F) -> Self
        where
            F: Fn(usize, &str) -> (u16, String) + Send + Sync + 'static,
        {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let hits = Arc::new(AtomicUsize::new(0));
            let requests = Arc::new(Mutex::new(Vec::new()));

            let server_hits = Arc::clone(&hits);
            let server_requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let (method, body) = read_request(&mut socket).await;
                    let n = server_hits.fetch_add(1, Ordering::SeqCst);
                    let (status, payload) = respond(n, &method);
                    server_requests.lock().unwrap().push((method, body));

                    let response = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        payload.len(),
                        payload
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            });

            Self {
                base_url,
                hits,
                requests,
            }
        }

        fn store(&self, max_retries: u32, poll_interval_ms: u64) -> HttpStore {
            HttpStore::new(HttpStoreConfig {
                base_url: self.base_url.clone(),
                api_key: Some("secret".to_string()),
                poll_interval_ms,
                max_retries,
                timeout_secs: 5,
            })
            .unwrap()
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    async fn read_request(socket: &mut TcpStream) -> (String, String) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];

        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break buf.len();
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let method = head.split_whitespace().next().unwrap_or_default().to_string();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        while buf.len() < header_end + content_length {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let end = (header_end + content_length).min(buf.len());
        let body = String::from_utf8_lossy(&buf[header_end..end]).to_string();
        (method, body)
    }

    fn doc_path() -> DocumentPath {
        DocumentPath::from_segments(["artifacts", "hub", "u1", "catalog"])
    }

    #[tokio::test]
    async fn test_missing_document_reads_as_none() {
        let server = StubServer::start(|_, _| (404, String::new())).await;
        let store = server.store(3, 60_000);

        assert_eq!(store.read(&doc_path()).await.unwrap(), None);
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_null_document_reads_as_none() {
        let server = StubServer::start(|_, _| (200, "null".to_string())).await;
        let store = server.store(3, 60_000);

        assert_eq!(store.read(&doc_path()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_error_is_retried_once() {
        let server = StubServer::start(|n, _| match n {
            0 => (503, String::new()),
            _ => (200, r#"{"list": []}"#.to_string()),
        })
        .await;
        let store = server.store(3, 60_000);

        let doc = store.read(&doc_path()).await.unwrap();
        assert_eq!(doc, Some(json!({"list": []})));
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_http_error() {
        let server = StubServer::start(|_, _| (429, String::new())).await;
        let store = server.store(1, 60_000);

        let err = store.read(&doc_path()).await.unwrap_err();
        match err {
            CatalogError::Http { status_code, .. } => assert_eq!(status_code, Some(429)),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = StubServer::start(|_, _| (403, String::new())).await;
        let store = server.store(3, 60_000);

        let err = store.read(&doc_path()).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_write_puts_and_publishes_locally() {
        let server = StubServer::start(|_, method| match method {
            "PUT" => (200, String::new()),
            _ => (404, String::new()),
        })
        .await;
        let store = server.store(3, 60_000);

        let mut sub = store.subscribe(&doc_path()).await.unwrap();
        assert_eq!(sub.latest(), None);

        let payload = json!({"list": [{"id": "a"}]});
        store.write(&doc_path(), payload.clone()).await.unwrap();

        // Delivered without waiting for a poll
        let delivered = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap();
        assert_eq!(delivered, Some(Some(payload.clone())));

        let requests = server.requests.lock().unwrap().clone();
        let (method, body) = requests.last().unwrap();
        assert_eq!(method, "PUT");
        assert_eq!(serde_json::from_str::<Value>(body).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_poll_publishes_only_changes() {
        // Initial read and first poll see v1, every later poll sees v2
        let server = StubServer::start(|n, _| match n {
            0 | 1 => (200, r#"{"v": 1}"#.to_string()),
            _ => (200, r#"{"v": 2}"#.to_string()),
        })
        .await;
        let store = server.store(0, 20);

        let mut sub = store.subscribe(&doc_path()).await.unwrap();
        assert_eq!(sub.latest(), Some(json!({"v": 1})));

        let delivered = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap();
        assert_eq!(delivered, Some(Some(json!({"v": 2}))));

        // Content stays at v2, so further polls deliver nothing
        let quiet = tokio::time::timeout(Duration::from_millis(150), sub.next()).await;
        assert!(quiet.is_err());
        assert!(server.hits() >= 3);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_millis(1000));
        assert_eq!(backoff(3), Duration::from_millis(2000));
        assert_eq!(backoff(50), Duration::from_millis(500 << MAX_BACKOFF_SHIFT));
    }

    #[test]
    fn test_basic_auth_header() {
        // base64("API_KEY:secret")
        assert_eq!(basic_auth("secret"), "Basic QVBJX0tFWTpzZWNyZXQ=");
    }

    #[test]
    fn test_url_joins_base_and_path() {
        let store = HttpStore::new(HttpStoreConfig {
            base_url: "https://docs.example.com/v1/".to_string(),
            ..HttpStoreConfig::default()
        })
        .unwrap();
        let path = DocumentPath::from_segments(["artifacts", "hub", "u1", "catalog"]);
        assert_eq!(
            store.url(&path),
            "https://docs.example.com/v1/artifacts/hub/u1/catalog"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_http_error() {
        let store = HttpStore::new(HttpStoreConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            max_retries: 0,
            timeout_secs: 2,
            ..HttpStoreConfig::default()
        })
        .unwrap();
        let path = DocumentPath::from_segments(["a", "b"]);
        let err = store.read(&path).await.unwrap_err();
        assert!(matches!(err, CatalogError::Http { .. }));
        assert!(err.is_transient());
    }
}
