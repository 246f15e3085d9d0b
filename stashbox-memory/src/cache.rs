use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stashbox_core::{
    BlobCache, CacheElement, CacheError, CacheResult, Clock, Serializer, SerializerSettings,
    ShutdownSignal, system_clock, validate,
};

/// In-memory cache backed by a mutex-guarded map.
///
/// The reference implementation of the blob-cache contract: identical
/// observable semantics to the persistent backend, including lazy
/// expiration, typed filtering and error kinds.
///
/// Cloning is cheap; clones share the same underlying map.
#[derive(Clone)]
pub struct InMemoryCache {
    inner: Arc<Inner>,
}

struct Inner {
    map: Mutex<HashMap<String, CacheElement>>,
    disposed: AtomicBool,
    shutdown: ShutdownSignal,
    serializer: Serializer,
    clock: Clock,
}

impl std::fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemoryCache {
    /// Creates an empty cache with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a cache with custom settings.
    pub fn builder() -> InMemoryCacheBuilder {
        InMemoryCacheBuilder::default()
    }

    fn check_disposed(&self) -> CacheResult<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(CacheError::Disposed)
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheElement>> {
        match self.inner.map.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`InMemoryCache`].
pub struct InMemoryCacheBuilder {
    serializer_settings: SerializerSettings,
    clock: Clock,
}

impl Default for InMemoryCacheBuilder {
    fn default() -> Self {
        InMemoryCacheBuilder {
            serializer_settings: SerializerSettings::default(),
            clock: system_clock,
        }
    }
}

impl InMemoryCacheBuilder {
    /// Serializer settings used by the typed-object operations.
    pub fn serializer_settings(mut self, settings: SerializerSettings) -> Self {
        self.serializer_settings = settings;
        self
    }

    /// Overrides the clock used for `created_at` stamps and expiration.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the cache.
    pub fn build(self) -> InMemoryCache {
        InMemoryCache {
            inner: Arc::new(Inner {
                map: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
                shutdown: ShutdownSignal::new(),
                serializer: Serializer::new(self.serializer_settings),
                clock: self.clock,
            }),
        }
    }
}

#[async_trait]
impl BlobCache for InMemoryCache {
    fn serializer(&self) -> &Serializer {
        &self.inner.serializer
    }

    fn now(&self) -> DateTime<Utc> {
        (self.inner.clock)()
    }

    async fn insert_elements(&self, elements: Vec<CacheElement>) -> CacheResult<()> {
        self.check_disposed()?;
        validate::elements(&elements)?;
        let mut map = self.lock();
        for element in elements {
            map.insert(element.key.clone(), element);
        }
        Ok(())
    }

    async fn get_elements(&self, keys: Vec<String>) -> CacheResult<Vec<CacheElement>> {
        self.check_disposed()?;
        validate::keys(&keys)?;
        let now = self.now();
        let mut map = self.lock();
        let mut found = Vec::new();
        for key in &keys {
            match map.get(key) {
                Some(element) if element.is_expired(now) => {
                    map.remove(key);
                }
                Some(element) => found.push(element.clone()),
                None => {}
            }
        }
        Ok(found)
    }

    async fn get_elements_of_type(&self, type_names: Vec<String>) -> CacheResult<Vec<CacheElement>> {
        self.check_disposed()?;
        validate::type_names(&type_names)?;
        let now = self.now();
        let mut map = self.lock();
        let mut found = Vec::new();
        let mut expired = Vec::new();
        for (key, element) in map.iter() {
            let matches = element
                .type_name
                .as_deref()
                .is_some_and(|name| type_names.iter().any(|wanted| wanted == name));
            if !matches {
                continue;
            }
            if element.is_expired(now) {
                expired.push(key.clone());
            } else {
                found.push(element.clone());
            }
        }
        for key in expired {
            map.remove(&key);
        }
        Ok(found)
    }

    async fn get_all_keys(&self) -> CacheResult<Vec<String>> {
        self.check_disposed()?;
        let now = self.now();
        let map = self.lock();
        Ok(map
            .values()
            .filter(|element| !element.is_expired(now))
            .map(|element| element.key.clone())
            .collect())
    }

    async fn invalidate_keys(&self, keys: Vec<String>) -> CacheResult<()> {
        self.check_disposed()?;
        validate::keys(&keys)?;
        let mut map = self.lock();
        for key in &keys {
            map.remove(key);
        }
        Ok(())
    }

    async fn invalidate_type(&self, type_names: Vec<String>) -> CacheResult<()> {
        self.check_disposed()?;
        validate::type_names(&type_names)?;
        let mut map = self.lock();
        map.retain(|_, element| {
            !element
                .type_name
                .as_deref()
                .is_some_and(|name| type_names.iter().any(|wanted| wanted == name))
        });
        Ok(())
    }

    async fn invalidate_all(&self) -> CacheResult<()> {
        self.check_disposed()?;
        self.lock().clear();
        Ok(())
    }

    async fn flush(&self) -> CacheResult<()> {
        // Nothing buffered: the map is the store.
        self.check_disposed()
    }

    async fn vacuum(&self) -> CacheResult<()> {
        self.check_disposed()?;
        let now = self.now();
        self.lock().retain(|_, element| !element.is_expired(now));
        Ok(())
    }

    async fn dispose(&self) -> CacheResult<()> {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            self.lock().clear();
            self.inner.shutdown.fire();
        }
        Ok(())
    }

    async fn wait_for_shutdown(&self) {
        self.inner.shutdown.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stashbox_core::ObjectCache;

    #[tokio::test]
    async fn expired_entries_are_evicted_on_read() {
        let cache = InMemoryCache::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        cache
            .insert("stale", Bytes::from_static(b"x"), Some(past))
            .await
            .unwrap();

        assert!(matches!(
            cache.get("stale").await,
            Err(CacheError::KeyNotFound(_))
        ));
        // The read physically removed the entry.
        assert!(cache.lock().is_empty());
    }

    #[tokio::test]
    async fn vacuum_deletes_only_expired_entries() {
        let cache = InMemoryCache::new();
        let past = Utc::now() - chrono::Duration::seconds(5);
        let future = Utc::now() + chrono::Duration::hours(1);
        cache
            .insert("dead", Bytes::from_static(b"a"), Some(past))
            .await
            .unwrap();
        cache
            .insert("live", Bytes::from_static(b"b"), Some(future))
            .await
            .unwrap();
        cache
            .insert("forever", Bytes::from_static(b"c"), None)
            .await
            .unwrap();

        cache.vacuum().await.unwrap();

        let mut keys = cache.get_all_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["forever", "live"]);
    }

    #[tokio::test]
    async fn dispose_rejects_further_operations() {
        let cache = InMemoryCache::new();
        cache.dispose().await.unwrap();
        assert!(matches!(
            cache.get("k").await,
            Err(CacheError::Disposed)
        ));
        // Idempotent.
        cache.dispose().await.unwrap();
        cache.wait_for_shutdown().await;
    }
}
