use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, instrument};
use url::Url;

use crate::backend::{HostContext, VersionControl};
use crate::error::{ShelveError, ShelveResult};

/// Lazily resolved, cached connection URI to the backend server.
///
/// The cache is written by [`resolve`](Self::resolve) and cleared by
/// [`invalidate`](Self::invalidate). Concurrent invalidations race benignly:
/// the worst case is one extra resolution on the next attempt.
pub struct ConnectionLifecycle {
    host: Arc<dyn HostContext>,
    cached: RwLock<Option<Url>>,
}

impl ConnectionLifecycle {
    pub fn new(host: Arc<dyn HostContext>) -> Self {
        Self {
            host,
            cached: RwLock::new(None),
        }
    }

    /// Return the cached connection, resolving and authenticating it if absent.
    #[instrument(skip(self, backend), level = "debug")]
    pub async fn resolve(&self, backend: &dyn VersionControl) -> ShelveResult<Url> {
        if let Some(uri) = self.cached() {
            return Ok(uri);
        }

        let context = self.host.active_project_context().await?.ok_or_else(|| {
            ShelveError::Connection("no active project context".to_string())
        })?;

        let uri = canonical_uri(&context.domain_uri)?;
        backend.authenticate(&uri).await?;

        debug!("Resolved {} connection to {}", backend.backend_name(), uri);
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(uri.clone());
        Ok(uri)
    }

    /// Drop the cached connection so the next attempt resolves from scratch.
    pub fn invalidate(&self) {
        let previous = self
            .cached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(uri) = previous {
            debug!("Invalidated connection to {}", uri);
        }
    }

    /// The cached connection, if any.
    pub fn cached(&self) -> Option<Url> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Decode a possibly percent-encoded domain URI into a parsed URL.
fn canonical_uri(domain_uri: &str) -> ShelveResult<Url> {
    let decoded = urlencoding::decode(domain_uri.trim()).map_err(|e| {
        ShelveError::Connection(format!("malformed domain URI '{}': {}", domain_uri, e))
    })?;
    Url::parse(&decoded).map_err(|e| {
        ShelveError::Connection(format!("malformed domain URI '{}': {}", domain_uri, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, StaticContext};

    const SERVER: &str = "https://tfs.example.com/DefaultCollection";

    #[tokio::test]
    async fn test_resolve_caches() {
        let backend = MemoryBackend::new();
        let connection = ConnectionLifecycle::new(Arc::new(StaticContext::new(SERVER)));

        let first = connection.resolve(&backend).await.unwrap();
        let second = connection.resolve(&backend).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(connection.cached(), Some(first));
        assert_eq!(backend.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_resolution() {
        let backend = MemoryBackend::new();
        let connection = ConnectionLifecycle::new(Arc::new(StaticContext::new(SERVER)));

        connection.resolve(&backend).await.unwrap();
        connection.invalidate();
        assert!(connection.cached().is_none());

        connection.resolve(&backend).await.unwrap();
        assert_eq!(backend.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_context() {
        let backend = MemoryBackend::new();
        let connection = ConnectionLifecycle::new(Arc::new(StaticContext::none()));

        let err = connection.resolve(&backend).await.unwrap_err();
        assert!(err.is_connection());
        assert!(connection.cached().is_none());
        assert_eq!(backend.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_uri() {
        let backend = MemoryBackend::new();
        let connection = ConnectionLifecycle::new(Arc::new(StaticContext::new("not a uri")));

        let err = connection.resolve(&backend).await.unwrap_err();
        assert!(err.is_connection());
        assert!(connection.cached().is_none());
    }

    #[tokio::test]
    async fn test_authentication_failure_leaves_cache_empty() {
        let backend = MemoryBackend::new();
        backend.reject_connections(true);
        let connection = ConnectionLifecycle::new(Arc::new(StaticContext::new(SERVER)));

        assert!(connection.resolve(&backend).await.is_err());
        assert!(connection.cached().is_none());
    }

    #[test]
    fn test_canonical_uri_decodes() {
        let uri = canonical_uri("https%3A%2F%2Ftfs.example.com%2FDefaultCollection").unwrap();
        assert_eq!(uri.as_str(), SERVER);
    }
}
