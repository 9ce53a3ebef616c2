use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use vesper_common::{Result, VesperError};

/// Pluggable key/value backend for persisted engine state
/// (delegation records, account deployment status).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store a value (insert or overwrite)
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch a value, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a value; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory implementation for testing
#[derive(Clone, Default)]
pub struct InMemoryStore {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values
            .lock()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut map = self.values.lock().map_err(|_| VesperError::Internal("Lock poisoned".into()))?;
        map.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.values.lock().map_err(|_| VesperError::Internal("Lock poisoned".into()))?;
        Ok(map.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.values.lock().map_err(|_| VesperError::Internal("Lock poisoned".into()))?;
        map.remove(key);
        Ok(())
    }
}

/// Local on-disk store, one file per key. Values are written as-is (no encryption).
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| VesperError::StorageError(format!("create {}: {e}", self.dir.display())))?;
        let path = self.path_for(key);
        // Write-then-rename so a crash never leaves a torn record
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| VesperError::StorageError(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| VesperError::StorageError(format!("rename {}: {e}", path.display())))?;
        debug!(path = %path.display(), "record written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VesperError::StorageError(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VesperError::StorageError(e.to_string())),
        }
    }
}

/// Remote store speaking plain HTTP: `PUT/GET/DELETE {base}/records/{key}`.
/// Callers wrap it in [`crate::EncryptedStore`] so only ciphertext leaves the process.
pub struct HttpStore {
    base_url: String,
    http: reqwest::Client,
    auth_token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn url(&self, key: &str) -> String {
        format!("{}/records/{key}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, key: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, self.url(key));
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl RecordStore for HttpStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, key)
            .header("Content-Type", "application/octet-stream")
            .body(value)
            .send()
            .await
            .map_err(|e| VesperError::StorageError(format!("remote put: {e}")))?;
        if !resp.status().is_success() {
            return Err(VesperError::StorageError(format!("remote put: HTTP {}", resp.status())));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self
            .request(reqwest::Method::GET, key)
            .send()
            .await
            .map_err(|e| VesperError::StorageError(format!("remote get: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(VesperError::StorageError(format!("remote get: HTTP {}", resp.status())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| VesperError::StorageError(format!("remote get body: {e}")))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE, key)
            .send()
            .await
            .map_err(|e| VesperError::StorageError(format!("remote delete: {e}")))?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(VesperError::StorageError(format!("remote delete: HTTP {}", resp.status())));
        }
        Ok(())
    }
}
