use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{OnceCell, oneshot};

use stashbox_core::{
    BlobCache, CacheElement, CacheError, CacheResult, Clock, IdentityTransform, PayloadTransform,
    Serializer, SerializerSettings, system_clock, validate,
};

use crate::queue::{Operation, OperationQueue, QueueStats, StoreTarget};

/// Persistent cache backed by a SQLite database file.
///
/// All SQL flows through a single writer thread that owns the connection
/// exclusively; see the crate docs for the batching and coalescing rules.
/// Every public operation checks disposal, awaits schema initialization,
/// applies the configured payload transform at the storage boundary, and
/// then waits on its queued operation's completion.
///
/// Cloning is cheap; clones share the same queue and database.
#[derive(Clone)]
pub struct SqliteCache {
    inner: Arc<Inner>,
}

struct Inner {
    queue: OperationQueue,
    init: OnceCell<CacheResult<()>>,
    init_rx: Mutex<Option<oneshot::Receiver<CacheResult<()>>>>,
    disposed: AtomicBool,
    serializer: Serializer,
    transform: Box<dyn PayloadTransform>,
    clock: Clock,
}

impl std::fmt::Debug for SqliteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCache")
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl SqliteCache {
    /// Starts building a cache. The default target is an in-memory
    /// database; call [`SqliteCacheBuilder::path`] for persistence.
    pub fn builder() -> SqliteCacheBuilder {
        SqliteCacheBuilder::default()
    }

    /// Opens (or creates) a persistent cache at `path` and waits for
    /// schema initialization to complete.
    pub async fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
        let cache = Self::builder().path(path).build()?;
        cache.initialized().await?;
        Ok(cache)
    }

    /// Opens an in-memory cache, useful in tests.
    pub async fn open_in_memory() -> CacheResult<Self> {
        let cache = Self::builder().build()?;
        cache.initialized().await?;
        Ok(cache)
    }

    /// Completes once the schema has been created or migrated. Concurrent
    /// callers observing an in-flight initialization share the same
    /// completion.
    pub async fn initialized(&self) -> CacheResult<()> {
        let result = self
            .inner
            .init
            .get_or_init(|| async {
                let rx = {
                    let mut guard = match self.inner.init_rx.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard.take()
                };
                match rx {
                    Some(rx) => rx.await.unwrap_or(Err(CacheError::Disposed)),
                    None => Err(CacheError::Disposed),
                }
            })
            .await;
        result.clone()
    }

    /// Counters describing the writer thread's work so far.
    pub fn stats(&self) -> Arc<QueueStats> {
        self.inner.queue.stats()
    }

    fn check_disposed(&self) -> CacheResult<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(CacheError::Disposed)
        } else {
            Ok(())
        }
    }

    async fn submit<T, F>(&self, make: F) -> CacheResult<T>
    where
        F: FnOnce(oneshot::Sender<CacheResult<T>>) -> Operation,
    {
        let (done, rx) = oneshot::channel();
        self.inner.queue.enqueue(make(done))?;
        match rx.await {
            Ok(result) => result,
            // The worker dropped the completion while shutting down.
            Err(_) => Err(CacheError::Disposed),
        }
    }
}

/// Builder for [`SqliteCache`].
///
/// ```no_run
/// use stashbox_sqlite::SqliteCache;
/// use stashbox_core::{DateTimeKind, SerializerSettings};
///
/// let cache = SqliteCache::builder()
///     .path("/var/cache/myapp/blobs.db")
///     .serializer_settings(SerializerSettings {
///         forced_date_time_kind: Some(DateTimeKind::Utc),
///     })
///     .build();
/// ```
pub struct SqliteCacheBuilder {
    path: Option<PathBuf>,
    serializer_settings: SerializerSettings,
    transform: Box<dyn PayloadTransform>,
    clock: Clock,
}

impl Default for SqliteCacheBuilder {
    fn default() -> Self {
        SqliteCacheBuilder {
            path: None,
            serializer_settings: SerializerSettings::default(),
            transform: Box::new(IdentityTransform),
            clock: system_clock,
        }
    }
}

impl SqliteCacheBuilder {
    /// Enables persistent storage at the given file path.
    ///
    /// Without this, data lives only in memory and is lost on drop.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Serializer settings used by the typed-object operations.
    pub fn serializer_settings(mut self, settings: SerializerSettings) -> Self {
        self.serializer_settings = settings;
        self
    }

    /// Payload transform applied at the storage boundary: `before_write`
    /// on the way in, `after_read` on the way out. Defaults to identity.
    pub fn transform(mut self, transform: Box<dyn PayloadTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Overrides the clock used for `created_at` stamps and expiration.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Spawns the writer thread and returns the cache handle.
    ///
    /// Schema initialization happens on the writer; the first operation
    /// (or [`SqliteCache::initialized`]) surfaces any failure.
    pub fn build(self) -> CacheResult<SqliteCache> {
        let target = match self.path {
            Some(path) => StoreTarget::Path(path),
            None => StoreTarget::InMemory,
        };
        let (queue, init_rx) = OperationQueue::start(target, self.clock)?;
        Ok(SqliteCache {
            inner: Arc::new(Inner {
                queue,
                init: OnceCell::new(),
                init_rx: Mutex::new(Some(init_rx)),
                disposed: AtomicBool::new(false),
                serializer: Serializer::new(self.serializer_settings),
                transform: self.transform,
                clock: self.clock,
            }),
        })
    }
}

#[async_trait]
impl BlobCache for SqliteCache {
    fn serializer(&self) -> &Serializer {
        &self.inner.serializer
    }

    fn now(&self) -> DateTime<Utc> {
        (self.inner.clock)()
    }

    async fn insert_elements(&self, mut elements: Vec<CacheElement>) -> CacheResult<()> {
        self.check_disposed()?;
        validate::elements(&elements)?;
        self.initialized().await?;
        for element in &mut elements {
            let payload = std::mem::take(&mut element.value);
            element.value = self.inner.transform.before_write(payload)?;
        }
        self.submit(|done| Operation::Insert { elements, done }).await
    }

    async fn get_elements(&self, keys: Vec<String>) -> CacheResult<Vec<CacheElement>> {
        self.check_disposed()?;
        validate::keys(&keys)?;
        self.initialized().await?;
        let mut elements = self.submit(|done| Operation::Select { keys, done }).await?;
        for element in &mut elements {
            let payload = std::mem::take(&mut element.value);
            element.value = self.inner.transform.after_read(payload)?;
        }
        Ok(elements)
    }

    async fn get_elements_of_type(&self, type_names: Vec<String>) -> CacheResult<Vec<CacheElement>> {
        self.check_disposed()?;
        validate::type_names(&type_names)?;
        self.initialized().await?;
        let mut elements = self
            .submit(|done| Operation::SelectByType { type_names, done })
            .await?;
        for element in &mut elements {
            let payload = std::mem::take(&mut element.value);
            element.value = self.inner.transform.after_read(payload)?;
        }
        Ok(elements)
    }

    async fn get_all_keys(&self) -> CacheResult<Vec<String>> {
        self.check_disposed()?;
        self.initialized().await?;
        self.submit(|done| Operation::GetAllKeys { done }).await
    }

    async fn invalidate_keys(&self, keys: Vec<String>) -> CacheResult<()> {
        self.check_disposed()?;
        validate::keys(&keys)?;
        self.initialized().await?;
        self.submit(|done| Operation::Invalidate { keys, done }).await
    }

    async fn invalidate_type(&self, type_names: Vec<String>) -> CacheResult<()> {
        self.check_disposed()?;
        validate::type_names(&type_names)?;
        self.initialized().await?;
        self.submit(|done| Operation::InvalidateByType { type_names, done })
            .await
    }

    async fn invalidate_all(&self) -> CacheResult<()> {
        self.check_disposed()?;
        self.initialized().await?;
        self.submit(|done| Operation::InvalidateAll { done }).await
    }

    async fn flush(&self) -> CacheResult<()> {
        self.check_disposed()?;
        self.initialized().await?;
        self.submit(|done| Operation::Flush { done }).await
    }

    async fn vacuum(&self) -> CacheResult<()> {
        self.check_disposed()?;
        self.initialized().await?;
        self.submit(|done| Operation::Vacuum { done }).await
    }

    async fn dispose(&self) -> CacheResult<()> {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            // New enqueues fail from here on; the worker drains what is
            // already queued, then releases the database and fires the
            // shutdown signal.
            self.inner.queue.close();
        }
        Ok(())
    }

    async fn wait_for_shutdown(&self) {
        self.inner.queue.shutdown_signal().wait().await;
    }
}
