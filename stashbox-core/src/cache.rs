//! The blob cache contract.
//!
//! The contract is split in two, so backends stay object-safe while users
//! get the full typed surface:
//!
//! - [`BlobCache`]: the primitive, object-safe operations every backend
//!   implements (bulk upsert, bulk select, typed filtering, invalidation,
//!   flush, vacuum, disposal).
//! - [`ObjectCache`]: a blanket extension layering the single-key and
//!   typed-object operations of the public API on top of the primitives.
//!
//! All operations fail with [`CacheError::Disposed`] after shutdown and
//! with [`CacheError::ArgumentInvalid`] for empty keys.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::element::CacheElement;
use crate::error::{CacheError, CacheResult};
use crate::serializer::{DEFAULT_SERIALIZER, Serializer};
use crate::storable::{Storable, type_name_of};

/// Clock used to stamp `created_at` and evaluate expiration.
pub type Clock = fn() -> DateTime<Utc>;

/// The default clock.
pub fn system_clock() -> DateTime<Utc> {
    Utc::now()
}

/// Primitive operations every cache backend implements.
///
/// Implementations must honour lazy expiration: a read that observes an
/// expired entry must not return it and must evict it.
#[async_trait]
pub trait BlobCache: Send + Sync {
    /// The serializer used by the typed-object operations.
    fn serializer(&self) -> &Serializer {
        &DEFAULT_SERIALIZER
    }

    /// The cache's configured clock.
    fn now(&self) -> DateTime<Utc> {
        system_clock()
    }

    /// Upserts a batch of elements atomically: either all are inserted or
    /// the batch fails.
    async fn insert_elements(&self, elements: Vec<CacheElement>) -> CacheResult<()>;

    /// Fetches the present, non-expired elements for the given keys.
    ///
    /// Missing keys are simply absent from the result; expired entries
    /// encountered are evicted.
    async fn get_elements(&self, keys: Vec<String>) -> CacheResult<Vec<CacheElement>>;

    /// Fetches all non-expired elements whose type tag matches any of the
    /// given names.
    async fn get_elements_of_type(&self, type_names: Vec<String>) -> CacheResult<Vec<CacheElement>>;

    /// Returns the creation instant of an entry, or `None` if it does not
    /// exist. Never fails with [`CacheError::KeyNotFound`].
    async fn get_created_at(&self, key: &str) -> CacheResult<Option<DateTime<Utc>>> {
        let mut elements = self.get_elements(vec![key.to_owned()]).await?;
        Ok(elements.pop().map(|element| element.created_at))
    }

    /// Returns all non-expired keys.
    async fn get_all_keys(&self) -> CacheResult<Vec<String>>;

    /// Removes the given keys. Removing an absent key is not an error.
    async fn invalidate_keys(&self, keys: Vec<String>) -> CacheResult<()>;

    /// Removes all entries whose type tag matches any of the given names.
    async fn invalidate_type(&self, type_names: Vec<String>) -> CacheResult<()>;

    /// Removes every entry.
    async fn invalidate_all(&self) -> CacheResult<()>;

    /// Completes once all previously accepted writes are durable.
    async fn flush(&self) -> CacheResult<()>;

    /// Evicts all expired entries and reclaims space.
    async fn vacuum(&self) -> CacheResult<()>;

    /// Initiates shutdown. Idempotent; subsequent operations fail with
    /// [`CacheError::Disposed`].
    async fn dispose(&self) -> CacheResult<()>;

    /// Completes once the cache's resources have been fully released.
    /// Fires exactly once, after final cleanup.
    async fn wait_for_shutdown(&self);
}

/// User-facing operations, expressed in terms of the [`BlobCache`]
/// primitives and blanket-implemented for every backend.
#[async_trait]
pub trait ObjectCache: BlobCache {
    /// Upserts raw bytes under a key. `expiration` of `None` means never.
    async fn insert(
        &self,
        key: &str,
        value: Bytes,
        expiration: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        let element = CacheElement::new(key, value, self.now(), expiration);
        self.insert_elements(vec![element]).await
    }

    /// Atomically upserts a batch of raw-byte entries.
    async fn insert_many(
        &self,
        entries: Vec<(String, Bytes)>,
        expiration: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        let now = self.now();
        let elements = entries
            .into_iter()
            .map(|(key, value)| CacheElement::new(key, value, now, expiration))
            .collect();
        self.insert_elements(elements).await
    }

    /// Fetches the bytes stored under a key.
    ///
    /// Fails with [`CacheError::KeyNotFound`] if the key is absent or
    /// expired (and evicts on expiry).
    async fn get(&self, key: &str) -> CacheResult<Bytes> {
        let mut elements = self.get_elements(vec![key.to_owned()]).await?;
        match elements.pop() {
            Some(element) => Ok(element.value),
            None => Err(CacheError::KeyNotFound(key.to_owned())),
        }
    }

    /// Fetches the present, non-expired entries among `keys`.
    ///
    /// Missing keys are absent from the map; no per-key error is raised.
    async fn get_many(&self, keys: Vec<String>) -> CacheResult<HashMap<String, Bytes>> {
        let elements = self.get_elements(keys).await?;
        Ok(elements
            .into_iter()
            .map(|element| (element.key, element.value))
            .collect())
    }

    /// Removes a single key. Idempotent.
    async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.invalidate_keys(vec![key.to_owned()]).await
    }

    /// Removes a batch of keys. Idempotent.
    async fn invalidate_many(&self, keys: Vec<String>) -> CacheResult<()> {
        self.invalidate_keys(keys).await
    }

    /// Serializes a value and upserts it under a key, tagged with the
    /// fully-qualified type name of `T`.
    async fn insert_object<T: Storable>(
        &self,
        key: &str,
        value: &T,
        expiration: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        let payload = self.serializer().serialize(value)?;
        let element =
            CacheElement::typed(key, type_name_of::<T>(), payload, self.now(), expiration);
        self.insert_elements(vec![element]).await
    }

    /// Fetches and deserializes the value stored under a key.
    async fn get_object<T: Storable>(&self, key: &str) -> CacheResult<T> {
        let payload = self.get(key).await?;
        self.serializer().deserialize(&payload)
    }

    /// Fetches and deserializes every non-expired value of type `T`.
    async fn get_all_objects<T: Storable>(&self) -> CacheResult<Vec<T>> {
        let elements = self
            .get_elements_of_type(vec![type_name_of::<T>().to_owned()])
            .await?;
        elements
            .iter()
            .map(|element| self.serializer().deserialize(&element.value))
            .collect()
    }

    /// Removes the entry for a typed key. Idempotent.
    async fn invalidate_object<T: Storable>(&self, key: &str) -> CacheResult<()> {
        self.invalidate(key).await
    }

    /// Removes every entry of type `T`. Idempotent.
    async fn invalidate_all_objects<T: Storable>(&self) -> CacheResult<()> {
        self.invalidate_type(vec![type_name_of::<T>().to_owned()]).await
    }
}

impl<C: BlobCache + ?Sized> ObjectCache for C {}
