//! Process-wide named cache slots and the shutdown barrier.
//!
//! Four slots cover the usual client-application storage tiers:
//! machine-local data, user-account data, protected secrets and a purely
//! in-process scratch cache. Slots are resolved lazily; once shutdown is
//! requested, resolutions return a [`SinkCache`] that rejects all work,
//! so racing callers are safe rather than ordered.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing::debug;

use stashbox_core::{BlobCache, CacheError, CacheResult, SerializerSettings};
use stashbox_memory::InMemoryCache;
use stashbox_sqlite::SqliteCache;

use crate::encrypted::{EncryptedCache, IdentityProtector, Protector};
use crate::sink::SinkCache;

/// The named cache slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSlot {
    /// Machine-local data: safe to lose, never roams.
    LocalMachine,
    /// User-account data: settings and documents.
    UserAccount,
    /// Protected secrets, stored through the encrypted decorator.
    Secure,
    /// In-process scratch cache; never persisted.
    InMemory,
}

impl CacheSlot {
    fn file_name(self) -> &'static str {
        match self {
            CacheSlot::LocalMachine => "local-machine.db",
            CacheSlot::UserAccount => "user-account.db",
            CacheSlot::Secure => "secure.db",
            CacheSlot::InMemory => "",
        }
    }
}

/// Configuration for a [`Registry`].
#[derive(Clone)]
pub struct RegistryConfig {
    application_name: String,
    cache_dir: PathBuf,
    serializer_settings: SerializerSettings,
    protector: Arc<dyn Protector>,
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("application_name", &self.application_name)
            .field("cache_dir", &self.cache_dir)
            .field("serializer_settings", &self.serializer_settings)
            .finish_non_exhaustive()
    }
}

impl RegistryConfig {
    /// Creates a configuration with default serializer settings and the
    /// identity protector for the secure slot.
    pub fn new(application_name: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        RegistryConfig {
            application_name: application_name.into(),
            cache_dir: cache_dir.into(),
            serializer_settings: SerializerSettings::default(),
            protector: Arc::new(IdentityProtector),
        }
    }

    /// Serializer settings shared by every slot.
    pub fn serializer_settings(mut self, settings: SerializerSettings) -> Self {
        self.serializer_settings = settings;
        self
    }

    /// Protector used by the [`CacheSlot::Secure`] slot.
    pub fn protector(mut self, protector: impl Protector + 'static) -> Self {
        self.protector = Arc::new(protector);
        self
    }
}

#[derive(Default)]
struct State {
    config: Option<RegistryConfig>,
    slots: HashMap<CacheSlot, Arc<dyn BlobCache>>,
}

/// Process-wide registry of named cache slots.
///
/// The usual entry point is [`Registry::global`]; tests construct private
/// instances with [`Registry::new`] or overlay slots on the global one
/// with [`Registry::replace`] and restore them on teardown.
pub struct Registry {
    state: Mutex<State>,
    shutdown_requested: AtomicBool,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// The process-wide registry. Unconfigured until
    /// [`Registry::initialize`] is called.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::unconfigured)
    }

    /// Creates a configured, private registry.
    pub fn new(config: RegistryConfig) -> Self {
        Registry {
            state: Mutex::new(State {
                config: Some(config),
                slots: HashMap::new(),
            }),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    fn unconfigured() -> Self {
        Registry {
            state: Mutex::new(State::default()),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Supplies the configuration. Fails once any slot has been resolved.
    pub fn initialize(&self, config: RegistryConfig) -> CacheResult<()> {
        let mut state = self.lock();
        if !state.slots.is_empty() {
            return Err(CacheError::ArgumentInvalid(
                "registry is already initialized with live slots",
            ));
        }
        state.config = Some(config);
        Ok(())
    }

    /// The configured application name, if initialized.
    pub fn application_name(&self) -> Option<String> {
        self.lock()
            .config
            .as_ref()
            .map(|config| config.application_name.clone())
    }

    /// Resolves a named slot, creating its cache on first use.
    ///
    /// After shutdown has been requested, every resolution returns a
    /// [`SinkCache`] that fails all operations with
    /// [`CacheError::Disposed`].
    pub fn resolve(&self, slot: CacheSlot) -> CacheResult<Arc<dyn BlobCache>> {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Ok(Arc::new(SinkCache));
        }

        let mut state = self.lock();
        if let Some(cache) = state.slots.get(&slot) {
            return Ok(Arc::clone(cache));
        }

        let config = state.config.as_ref().ok_or(CacheError::ArgumentInvalid(
            "registry has not been initialized",
        ))?;
        let cache = build_slot(slot, config)?;
        state.slots.insert(slot, Arc::clone(&cache));
        debug!(?slot, "cache slot created");
        Ok(cache)
    }

    /// Shorthand for [`Registry::resolve`] with [`CacheSlot::LocalMachine`].
    pub fn local_machine(&self) -> CacheResult<Arc<dyn BlobCache>> {
        self.resolve(CacheSlot::LocalMachine)
    }

    /// Shorthand for [`Registry::resolve`] with [`CacheSlot::UserAccount`].
    pub fn user_account(&self) -> CacheResult<Arc<dyn BlobCache>> {
        self.resolve(CacheSlot::UserAccount)
    }

    /// Shorthand for [`Registry::resolve`] with [`CacheSlot::Secure`].
    pub fn secure(&self) -> CacheResult<Arc<dyn BlobCache>> {
        self.resolve(CacheSlot::Secure)
    }

    /// Shorthand for [`Registry::resolve`] with [`CacheSlot::InMemory`].
    pub fn in_memory(&self) -> CacheResult<Arc<dyn BlobCache>> {
        self.resolve(CacheSlot::InMemory)
    }

    /// Replaces a slot with the given cache, returning the previous
    /// occupant so tests can restore it on teardown.
    ///
    /// No-op once shutdown has been requested.
    pub fn replace(
        &self,
        slot: CacheSlot,
        cache: Arc<dyn BlobCache>,
    ) -> Option<Arc<dyn BlobCache>> {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return None;
        }
        self.lock().slots.insert(slot, cache)
    }

    /// Shuts down every live slot.
    ///
    /// Sets the shutdown flag (making subsequent resolutions return the
    /// sink), disposes each live cache, and completes once every slot's
    /// shutdown signal has fired. Idempotent.
    pub async fn shutdown(&self) -> CacheResult<()> {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let slots: Vec<Arc<dyn BlobCache>> = {
            let mut state = self.lock();
            state.slots.drain().map(|(_, cache)| cache).collect()
        };
        for cache in &slots {
            // A slot may already be disposed; disposal is idempotent.
            let _ = cache.dispose().await;
        }
        for cache in &slots {
            cache.wait_for_shutdown().await;
        }
        Ok(())
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

fn build_slot(slot: CacheSlot, config: &RegistryConfig) -> CacheResult<Arc<dyn BlobCache>> {
    if slot == CacheSlot::InMemory {
        let cache = InMemoryCache::builder()
            .serializer_settings(config.serializer_settings)
            .build();
        return Ok(Arc::new(cache));
    }

    std::fs::create_dir_all(&config.cache_dir).map_err(CacheError::backend)?;
    let path = config.cache_dir.join(slot.file_name());
    let builder = SqliteCache::builder()
        .path(path)
        .serializer_settings(config.serializer_settings);

    let cache: Arc<dyn BlobCache> = if slot == CacheSlot::Secure {
        Arc::new(EncryptedCache::from_builder(
            builder,
            Arc::clone(&config.protector),
        )?)
    } else {
        Arc::new(builder.build()?)
    };
    Ok(cache)
}
