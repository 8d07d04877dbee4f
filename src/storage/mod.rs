//! Addressable content storage.
//!
//! Documents, page intermediates, idempotency markers and callbacks are all
//! plain URIs. [`StorageRouter`] picks a backend by scheme so the rest of the
//! service never cares where bytes live.

pub mod http;
pub mod local;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

pub use http::HttpStorage;
pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// Free-form object metadata (content type, exception tags, page lists).
pub type Metadata = HashMap<String, String>;

/// Metadata key marking an object written after an extraction exception.
pub const EXCEPTION_KEY: &str = "exception";

#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, uri: &str) -> Result<Vec<u8>>;
    async fn write(&self, uri: &str, data: Vec<u8>, metadata: Metadata) -> Result<()>;
    async fn exists(&self, uri: &str) -> Result<bool>;
    async fn metadata(&self, uri: &str) -> Result<Metadata>;
    async fn delete(&self, uris: &[String]) -> Result<()>;
    /// Immediate children of a prefix, as full URIs.
    async fn list(&self, uri: &str) -> Result<Vec<String>>;
}

/// Dispatches each call to the backend registered for the URI's scheme.
#[derive(Clone)]
pub struct StorageRouter {
    memory: Option<Arc<MemoryStorage>>,
    local: Option<Arc<LocalStorage>>,
    http: Option<Arc<HttpStorage>>,
}

impl StorageRouter {
    pub fn new() -> Self {
        Self {
            memory: None,
            local: None,
            http: None,
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStorage>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_local(mut self, local: Arc<LocalStorage>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_http(mut self, http: Arc<HttpStorage>) -> Self {
        self.http = Some(http);
        self
    }

    fn backend(&self, uri: &str) -> Result<&dyn Storage> {
        let backend: Option<&dyn Storage> = match scheme(uri) {
            Some("mem") => self.memory.as_deref().map(|s| s as &dyn Storage),
            Some("file") | None => self.local.as_deref().map(|s| s as &dyn Storage),
            Some("http") | Some("https") => self.http.as_deref().map(|s| s as &dyn Storage),
            Some(_) => None,
        };
        backend.ok_or_else(|| anyhow::anyhow!("<{}> is an unsupported URI", uri))
    }
}

impl Default for StorageRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Storage for StorageRouter {
    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        self.backend(uri)?.read(uri).await
    }

    async fn write(&self, uri: &str, data: Vec<u8>, metadata: Metadata) -> Result<()> {
        self.backend(uri)?.write(uri, data, metadata).await
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        self.backend(uri)?.exists(uri).await
    }

    async fn metadata(&self, uri: &str) -> Result<Metadata> {
        self.backend(uri)?.metadata(uri).await
    }

    async fn delete(&self, uris: &[String]) -> Result<()> {
        for uri in uris {
            self.backend(uri)?.delete(std::slice::from_ref(uri)).await?;
        }
        Ok(())
    }

    async fn list(&self, uri: &str) -> Result<Vec<String>> {
        self.backend(uri)?.list(uri).await
    }
}

/// URI scheme, or `None` for a bare filesystem path.
pub fn scheme(uri: &str) -> Option<&str> {
    let (scheme, _) = uri.split_once("://")?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
        return None;
    }
    Some(scheme)
}

/// Join a prefix and a relative name with exactly one `/`.
pub fn join(prefix: &str, name: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

/// Lower-cased extension (with the dot) of the URI path, ignoring query and fragment.
pub fn extension(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let path = match path.split_once("://") {
        Some((_, rest)) => rest,
        None => path,
    };
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_lowercase(),
        _ => String::new(),
    }
}

/// Read an object as text, dropping invalid UTF-8.
pub async fn read_text(storage: &dyn Storage, uri: &str) -> Result<String> {
    let bytes = storage.read(uri).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme() {
        assert_eq!(scheme("mem://a/b"), Some("mem"));
        assert_eq!(scheme("https://host/x"), Some("https"));
        assert_eq!(scheme("/tmp/doc.pdf"), None);
        assert_eq!(scheme("relative/doc.pdf"), None);
    }

    #[test]
    fn test_join() {
        assert_eq!(join("mem://tmp/", "/a.txt"), "mem://tmp/a.txt");
        assert_eq!(join("mem://tmp", "a.txt"), "mem://tmp/a.txt");
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("mem://bucket/Report.PDF"), ".pdf");
        assert_eq!(extension("https://h/x/scan.tiff?sig=abc.def"), ".tiff");
        assert_eq!(extension("/tmp/archive.tar.gz"), ".gz");
        assert_eq!(extension("mem://bucket/noext"), "");
        assert_eq!(extension("mem://bucket.name/noext"), "");
        assert_eq!(extension("/tmp/.hidden"), "");
    }

    #[tokio::test]
    async fn test_router_dispatch_and_unsupported_scheme() {
        let router = StorageRouter::new().with_memory(Arc::new(MemoryStorage::new()));
        router
            .write("mem://x/y.txt", b"hi".to_vec(), Metadata::new())
            .await
            .unwrap();
        assert!(router.exists("mem://x/y.txt").await.unwrap());
        assert_eq!(read_text(&router, "mem://x/y.txt").await.unwrap(), "hi");

        let err = router.read("gopher://x/y.txt").await.unwrap_err();
        assert!(err.to_string().contains("unsupported URI"));
        // No local backend registered.
        assert!(router.exists("/tmp/y.txt").await.is_err());
    }
}
