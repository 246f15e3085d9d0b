#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod encrypted;
mod registry;
mod sink;

pub use encrypted::{EncryptedCache, IdentityProtector, ProtectionError, Protector, UserKeyProtector};
pub use registry::{CacheSlot, Registry, RegistryConfig};
pub use sink::SinkCache;

pub use stashbox_core::{
    BlobCache, CacheElement, CacheError, CacheResult, DateTimeKind, IdentityTransform, ObjectCache,
    PayloadTransform, Raw, Serializer, SerializerSettings, ShutdownSignal, Storable,
};
pub use stashbox_memory::InMemoryCache;
pub use stashbox_sqlite::{QueueStats, SqliteCache, SqliteCacheBuilder};

/// The stashbox prelude.
///
/// ```rust
/// use stashbox::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{BlobCache, CacheError, CacheResult, ObjectCache};
}
