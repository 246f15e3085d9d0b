//! Terminal cache handed out after registry shutdown.

use async_trait::async_trait;

use stashbox_core::{BlobCache, CacheElement, CacheError, CacheResult};

/// A cache that rejects every operation with [`CacheError::Disposed`].
///
/// Resolutions racing a registry shutdown land here instead of on a live
/// backend; the race is safe because the sink refuses all work.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkCache;

#[async_trait]
impl BlobCache for SinkCache {
    async fn insert_elements(&self, _elements: Vec<CacheElement>) -> CacheResult<()> {
        Err(CacheError::Disposed)
    }

    async fn get_elements(&self, _keys: Vec<String>) -> CacheResult<Vec<CacheElement>> {
        Err(CacheError::Disposed)
    }

    async fn get_elements_of_type(
        &self,
        _type_names: Vec<String>,
    ) -> CacheResult<Vec<CacheElement>> {
        Err(CacheError::Disposed)
    }

    async fn get_all_keys(&self) -> CacheResult<Vec<String>> {
        Err(CacheError::Disposed)
    }

    async fn invalidate_keys(&self, _keys: Vec<String>) -> CacheResult<()> {
        Err(CacheError::Disposed)
    }

    async fn invalidate_type(&self, _type_names: Vec<String>) -> CacheResult<()> {
        Err(CacheError::Disposed)
    }

    async fn invalidate_all(&self) -> CacheResult<()> {
        Err(CacheError::Disposed)
    }

    async fn flush(&self) -> CacheResult<()> {
        Err(CacheError::Disposed)
    }

    async fn vacuum(&self) -> CacheResult<()> {
        Err(CacheError::Disposed)
    }

    async fn dispose(&self) -> CacheResult<()> {
        Ok(())
    }

    async fn wait_for_shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use stashbox_core::ObjectCache;

    #[tokio::test]
    async fn every_operation_is_rejected() {
        let sink = SinkCache;
        assert!(matches!(sink.get("k").await, Err(CacheError::Disposed)));
        assert!(matches!(
            sink.insert("k", bytes::Bytes::new(), None).await,
            Err(CacheError::Disposed)
        ));
        assert!(matches!(sink.get_all_keys().await, Err(CacheError::Disposed)));
        sink.dispose().await.unwrap();
        sink.wait_for_shutdown().await;
    }
}
