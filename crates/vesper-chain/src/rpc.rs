use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("all RPC endpoints failed for {label}")]
    AllEndpointsFailed { label: String },
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc { code: i64, message: String },
    #[error("deserialization error: {0}")]
    Deserialize(String),
    #[error("no endpoints configured for {0}")]
    NoEndpoints(String),
}

impl RpcError {
    /// JSON-RPC errors are answers from a healthy node; everything else is transport.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RpcError::JsonRpc { .. })
    }
}

const FAILURE_THRESHOLD: u32 = 3;
const COOLDOWN: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u64,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl From<ErrorObject> for RpcError {
    fn from(err: ErrorObject) -> Self {
        // Revert reasons often arrive in `data`; keep them with the message
        let message = match err.data {
            Some(data) if !data.is_null() => format!("{} ({data})", err.message),
            _ => err.message,
        };
        RpcError::JsonRpc { code: err.code, message }
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    url: String,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl Endpoint {
    fn new(url: String) -> Self {
        Self {
            url,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    /// Benched for `COOLDOWN` after `FAILURE_THRESHOLD` consecutive failures.
    fn is_healthy(&self) -> bool {
        match self.last_failure {
            Some(at) if self.consecutive_failures >= FAILURE_THRESHOLD => at.elapsed() > COOLDOWN,
            _ => true,
        }
    }

    fn record(&mut self, ok: bool) {
        if ok {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.last_failure = Some(Instant::now());
        }
    }
}

struct Cached {
    value: Value,
    expires_at: Instant,
}

/// Failover across the endpoints of one JSON-RPC service (a chain node,
/// a bundler, or a paymaster), with a small response cache.
pub struct RpcPool {
    label: String,
    endpoints: RwLock<Vec<Endpoint>>,
    http: reqwest::Client,
    cache: RwLock<HashMap<String, Cached>>,
    next_id: AtomicU64,
}

impl RpcPool {
    pub fn new(label: impl Into<String>, urls: Vec<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            label: label.into(),
            endpoints: RwLock::new(urls.into_iter().map(Endpoint::new).collect()),
            http,
            cache: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn cached(&self, key: &str) -> Option<Value> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .get(key)
            .filter(|c| Instant::now() < c.expires_at)
            .map(|c| c.value.clone())
    }

    pub(crate) fn remember(&self, key: String, value: Value, ttl: Duration) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.retain(|_, c| Instant::now() < c.expires_at);
        cache.insert(
            key,
            Cached {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// `request`, answered from cache for `ttl` after a success.
    pub async fn request_cached(&self, method: &str, params: Value, ttl: Duration) -> Result<Value, RpcError> {
        let key = format!("{method}:{params}");
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }
        let value = self.request(method, params).await?;
        self.remember(key, value.clone(), ttl);
        Ok(value)
    }

    /// Healthy endpoints first, benched ones as a last resort.
    fn ordered_endpoints(&self) -> Vec<(usize, String)> {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        let mut ordered: Vec<(usize, &Endpoint)> = endpoints.iter().enumerate().collect();
        ordered.sort_by_key(|(_, e)| !e.is_healthy());
        ordered.into_iter().map(|(i, e)| (i, e.url.clone())).collect()
    }

    fn record(&self, idx: usize, ok: bool) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        if let Some(endpoint) = endpoints.get_mut(idx) {
            endpoint.record(ok);
        }
    }

    async fn attempt(&self, url: &str, body: &Request<'_>) -> Result<Response, RpcError> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| RpcError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RpcError::Http(format!("HTTP {status}")));
        }
        resp.json::<Response>()
            .await
            .map_err(|e| RpcError::Deserialize(e.to_string()))
    }

    /// Send a JSON-RPC request, failing over on transport errors only.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let endpoints = self.ordered_endpoints();
        if endpoints.is_empty() {
            return Err(RpcError::NoEndpoints(self.label.clone()));
        }
        let body = Request {
            jsonrpc: "2.0",
            method,
            params: &params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let mut last_err = None;
        for (idx, url) in endpoints {
            debug!(pool = %self.label, %url, method, "rpc request");
            match self.attempt(&url, &body).await {
                Ok(resp) => {
                    self.record(idx, true);
                    // A JSON-RPC error is a healthy node's answer
                    return match resp.error {
                        Some(err) => Err(err.into()),
                        None => Ok(resp.result.unwrap_or(Value::Null)),
                    };
                }
                Err(e) => {
                    warn!(pool = %self.label, %url, method, %e, "rpc endpoint failed");
                    self.record(idx, false);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(RpcError::AllEndpointsFailed {
            label: self.label.clone(),
        }))
    }
}

/// Parse a JSON-RPC hex quantity (`"0x1a"`) into a u128.
pub fn parse_quantity(value: &Value) -> Result<u128, RpcError> {
    let hex = value
        .as_str()
        .ok_or_else(|| RpcError::Deserialize(format!("expected hex quantity, got {value}")))?;
    let digits = hex.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| RpcError::Deserialize(format!("invalid quantity {hex}: {e}")))
}

/// Parse JSON-RPC hex data (`"0xdeadbeef"`) into bytes.
pub fn parse_data(value: &Value) -> Result<Vec<u8>, RpcError> {
    let hex_str = value
        .as_str()
        .ok_or_else(|| RpcError::Deserialize(format!("expected hex data, got {value}")))?;
    hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|e| RpcError::Deserialize(format!("invalid hex data: {e}")))
}

pub fn quantity(value: u128) -> String {
    format!("0x{value:x}")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    /// Serves the given JSON bodies in order (repeating the last) on an ephemeral port.
    pub(crate) async fn mock_rpc_server(responses: Vec<&'static str>) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let counter = Arc::new(AtomicU32::new(0));

        tokio::spawn(async move {
            for _ in 0..16 {
                if let Ok((mut stream, _)) = listener.accept().await {
                    let mut buf = vec![0u8; 8192];
                    let _ = stream.read(&mut buf).await;
                    let idx = counter.fetch_add(1, Ordering::SeqCst) as usize;
                    let body = responses
                        .get(idx)
                        .or_else(|| responses.last())
                        .copied()
                        .unwrap_or("{}");
                    let http_resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(http_resp.as_bytes()).await;
                }
            }
        });
        port
    }

    #[test]
    fn test_endpoint_benched_after_threshold() {
        let mut ep = Endpoint::new("http://localhost".into());
        assert!(ep.is_healthy());

        ep.record(false);
        ep.record(false);
        assert!(ep.is_healthy());

        ep.record(false);
        assert!(!ep.is_healthy());

        ep.record(true);
        assert!(ep.is_healthy());
    }

    #[test]
    fn test_cache_expiry() {
        let pool = RpcPool::new("test", vec!["http://localhost".into()]);
        pool.remember("k".into(), serde_json::json!("v"), Duration::from_millis(1));
        assert!(pool.cached("k").is_some());
        std::thread::sleep(Duration::from_millis(5));
        assert!(pool.cached("k").is_none());
    }

    #[tokio::test]
    async fn test_request_cached_skips_second_call() {
        let port = mock_rpc_server(vec![
            r#"{"jsonrpc":"2.0","result":"0x1","id":1}"#,
            r#"{"jsonrpc":"2.0","result":"0x2","id":2}"#,
        ])
        .await;
        let pool = RpcPool::new("chain", vec![format!("http://127.0.0.1:{port}")]);
        let params = serde_json::json!(["0xabc", "latest"]);
        let first = pool
            .request_cached("eth_getBalance", params.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        let second = pool
            .request_cached("eth_getBalance", params, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first, serde_json::json!("0x1"));
        assert_eq!(second, first);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&serde_json::json!("0x10")).unwrap(), 16);
        assert_eq!(parse_quantity(&serde_json::json!("0x")).unwrap(), 0);
        assert!(parse_quantity(&serde_json::json!(16)).is_err());
        assert_eq!(quantity(255), "0xff");
    }

    #[tokio::test]
    async fn test_rpc_pool_no_endpoints() {
        let pool = RpcPool::new("empty", vec![]);
        let result = pool.request("eth_blockNumber", serde_json::json!([])).await;
        assert!(matches!(result, Err(RpcError::NoEndpoints(_))));
    }

    #[tokio::test]
    async fn test_rpc_pool_failover() {
        let port = mock_rpc_server(vec![r#"{"jsonrpc":"2.0","result":"0xabc","id":1}"#]).await;

        let pool = RpcPool::new(
            "chain",
            vec![
                "http://127.0.0.1:1".into(), // dead
                format!("http://127.0.0.1:{port}"),
            ],
        );
        let result = pool
            .request("eth_blockNumber", serde_json::json!([]))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("0xabc"));

        let eps = pool.endpoints.read().unwrap();
        assert!(eps[0].consecutive_failures > 0);
        assert_eq!(eps[1].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_rpc_json_rpc_error_not_failed_over() {
        let port = mock_rpc_server(vec![
            r#"{"jsonrpc":"2.0","error":{"code":-32500,"message":"AA21 didn't pay prefund"},"id":1}"#,
        ])
        .await;

        let pool = RpcPool::new("bundler", vec![format!("http://127.0.0.1:{port}")]);
        match pool.request("eth_sendUserOperation", serde_json::json!([])).await {
            Err(e @ RpcError::JsonRpc { .. }) => {
                assert!(!e.is_transport());
                assert!(e.to_string().contains("AA21"));
            }
            other => panic!("expected JsonRpc error, got: {other:?}"),
        }
    }
}
