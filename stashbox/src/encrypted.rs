//! Encrypted decorator for the persistent cache.
//!
//! Payloads are run through a [`Protector`] at the storage boundary:
//! protected just before they reach the database, unprotected on the way
//! back. Empty payloads bypass the protector entirely, since protecting a
//! zero-length buffer is undefined on some platforms.

use std::path::Path;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;

use stashbox_core::{
    BlobCache, CacheElement, CacheError, CacheResult, PayloadTransform, Serializer,
};
use stashbox_sqlite::{SqliteCache, SqliteCacheBuilder};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// Errors raised by a [`Protector`].
#[derive(Debug, Error)]
pub enum ProtectionError {
    /// The cipher rejected the payload.
    #[error("cipher rejected the payload")]
    Cipher,

    /// The protected payload is malformed (truncated or tampered).
    #[error("protected payload is malformed")]
    Malformed,
}

/// Protects payload bytes for the current user.
///
/// The persistent store never sees unprotected bytes; the pair of
/// operations must round-trip exactly.
pub trait Protector: Send + Sync {
    /// Protects a payload for storage.
    fn protect(&self, payload: &[u8]) -> Result<Vec<u8>, ProtectionError>;

    /// Recovers the original payload.
    fn unprotect(&self, payload: &[u8]) -> Result<Vec<u8>, ProtectionError>;
}

/// Pass-through protector for platforms without a protection API.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProtector;

impl Protector for IdentityProtector {
    fn protect(&self, payload: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        Ok(payload.to_vec())
    }

    fn unprotect(&self, payload: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        Ok(payload.to_vec())
    }
}

/// AES-256-GCM protector under a caller-supplied per-user key.
///
/// Each payload is sealed with a fresh random nonce; the nonce is
/// prefixed to the ciphertext.
pub struct UserKeyProtector {
    key: [u8; 32],
}

impl UserKeyProtector {
    /// Creates a protector from an existing 32-byte key.
    pub fn new(key: [u8; 32]) -> Self {
        UserKeyProtector { key }
    }

    /// Creates a protector with a freshly generated random key.
    ///
    /// The key lives only in this instance; payloads protected with it
    /// are unreadable after the process exits.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        UserKeyProtector { key }
    }

    fn cipher(&self) -> Result<Aes256Gcm, ProtectionError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| ProtectionError::Cipher)
    }
}

impl std::fmt::Debug for UserKeyProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserKeyProtector").finish_non_exhaustive()
    }
}

impl Protector for UserKeyProtector {
    fn protect(&self, payload: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| ProtectionError::Cipher)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unprotect(&self, payload: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(ProtectionError::Malformed);
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtectionError::Malformed)
    }
}

/// Payload transform that routes bytes through a [`Protector`].
pub(crate) struct ProtectedTransform {
    protector: Arc<dyn Protector>,
}

impl ProtectedTransform {
    pub(crate) fn new(protector: Arc<dyn Protector>) -> Self {
        ProtectedTransform { protector }
    }
}

impl PayloadTransform for ProtectedTransform {
    fn before_write(&self, payload: Bytes) -> CacheResult<Bytes> {
        if payload.is_empty() {
            return Ok(payload);
        }
        self.protector
            .protect(&payload)
            .map(Bytes::from)
            .map_err(CacheError::protection)
    }

    fn after_read(&self, payload: Bytes) -> CacheResult<Bytes> {
        if payload.is_empty() {
            return Ok(payload);
        }
        self.protector
            .unprotect(&payload)
            .map(Bytes::from)
            .map_err(CacheError::protection)
    }
}

/// Persistent cache whose payloads are protected at rest.
///
/// A decorator over [`SqliteCache`]: every contract operation is
/// delegated; only the payload transform differs.
#[derive(Clone, Debug)]
pub struct EncryptedCache {
    inner: SqliteCache,
}

impl EncryptedCache {
    /// Opens (or creates) an encrypted cache at `path` and waits for
    /// schema initialization.
    pub async fn open(
        path: impl AsRef<Path>,
        protector: impl Protector + 'static,
    ) -> CacheResult<Self> {
        let cache = Self::from_builder(
            SqliteCache::builder().path(path),
            Arc::new(protector),
        )?;
        cache.inner.initialized().await?;
        Ok(cache)
    }

    /// Opens an in-memory encrypted cache, useful in tests.
    pub async fn open_in_memory(protector: impl Protector + 'static) -> CacheResult<Self> {
        let cache = Self::from_builder(SqliteCache::builder(), Arc::new(protector))?;
        cache.inner.initialized().await?;
        Ok(cache)
    }

    /// Wraps a configured builder with the given protector.
    ///
    /// Initialization stays lazy: the first operation surfaces failures.
    pub fn from_builder(
        builder: SqliteCacheBuilder,
        protector: Arc<dyn Protector>,
    ) -> CacheResult<Self> {
        let inner = builder
            .transform(Box::new(ProtectedTransform::new(protector)))
            .build()?;
        Ok(EncryptedCache { inner })
    }
}

#[async_trait]
impl BlobCache for EncryptedCache {
    fn serializer(&self) -> &Serializer {
        self.inner.serializer()
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }

    async fn insert_elements(&self, elements: Vec<CacheElement>) -> CacheResult<()> {
        self.inner.insert_elements(elements).await
    }

    async fn get_elements(&self, keys: Vec<String>) -> CacheResult<Vec<CacheElement>> {
        self.inner.get_elements(keys).await
    }

    async fn get_elements_of_type(&self, type_names: Vec<String>) -> CacheResult<Vec<CacheElement>> {
        self.inner.get_elements_of_type(type_names).await
    }

    async fn get_all_keys(&self) -> CacheResult<Vec<String>> {
        self.inner.get_all_keys().await
    }

    async fn invalidate_keys(&self, keys: Vec<String>) -> CacheResult<()> {
        self.inner.invalidate_keys(keys).await
    }

    async fn invalidate_type(&self, type_names: Vec<String>) -> CacheResult<()> {
        self.inner.invalidate_type(type_names).await
    }

    async fn invalidate_all(&self) -> CacheResult<()> {
        self.inner.invalidate_all().await
    }

    async fn flush(&self) -> CacheResult<()> {
        self.inner.flush().await
    }

    async fn vacuum(&self) -> CacheResult<()> {
        self.inner.vacuum().await
    }

    async fn dispose(&self) -> CacheResult<()> {
        self.inner.dispose().await
    }

    async fn wait_for_shutdown(&self) {
        self.inner.wait_for_shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protect_round_trips() {
        let protector = UserKeyProtector::generate();
        let sealed = protector.protect(b"attack at dawn").unwrap();
        assert_ne!(sealed.as_slice(), b"attack at dawn");
        assert_eq!(protector.unprotect(&sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn nonces_are_fresh_per_payload() {
        let protector = UserKeyProtector::generate();
        let a = protector.protect(b"same").unwrap();
        let b = protector.protect(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_payloads_are_rejected() {
        let protector = UserKeyProtector::generate();
        let mut sealed = protector.protect(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(
            protector.unprotect(&sealed),
            Err(ProtectionError::Malformed)
        ));
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        let protector = UserKeyProtector::generate();
        assert!(matches!(
            protector.unprotect(b"short"),
            Err(ProtectionError::Malformed)
        ));
    }

    #[test]
    fn wrong_key_cannot_unprotect() {
        let sealed = UserKeyProtector::generate().protect(b"secret").unwrap();
        let other = UserKeyProtector::generate();
        assert!(other.unprotect(&sealed).is_err());
    }

    #[test]
    fn empty_payloads_bypass_the_transform() {
        let transform = ProtectedTransform::new(Arc::new(UserKeyProtector::generate()));
        let out = transform.before_write(Bytes::new()).unwrap();
        assert!(out.is_empty());
        let back = transform.after_read(Bytes::new()).unwrap();
        assert!(back.is_empty());
    }
}
