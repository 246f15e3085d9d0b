//! Payload transforms applied at the boundary of a persistent store.
//!
//! A pre-write transform runs on payload bytes just before they are handed
//! to the backend; the post-read transform runs on bytes coming back. The
//! pair is what makes transparent encryption a decorator concern rather
//! than a backend one.

use bytes::Bytes;

use crate::error::CacheResult;

/// A pair of pure payload transforms.
pub trait PayloadTransform: Send + Sync {
    /// Transforms a payload before it is written to the backend.
    fn before_write(&self, payload: Bytes) -> CacheResult<Bytes>;

    /// Transforms a payload read back from the backend.
    fn after_read(&self, payload: Bytes) -> CacheResult<Bytes>;
}

/// The default transform: payloads pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl PayloadTransform for IdentityTransform {
    fn before_write(&self, payload: Bytes) -> CacheResult<Bytes> {
        Ok(payload)
    }

    fn after_read(&self, payload: Bytes) -> CacheResult<Bytes> {
        Ok(payload)
    }
}
