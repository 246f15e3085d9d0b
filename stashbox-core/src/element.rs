//! The persistence record stored for every cache entry.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A single cache entry as stored by a backend.
///
/// The payload is opaque to the engine: it is stored verbatim as produced
/// by the pre-write transform, and never inspected. `expiration` of `None`
/// means the entry never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheElement {
    /// Unique, case-sensitive, non-empty key.
    pub key: String,
    /// Fully-qualified logical type name for entries written through the
    /// typed-object operations; `None` for raw-byte entries.
    pub type_name: Option<String>,
    /// Opaque payload bytes.
    pub value: Bytes,
    /// Wall-clock instant the entry was inserted, from the cache's clock.
    pub created_at: DateTime<Utc>,
    /// Absolute expiration instant; `None` means never.
    pub expiration: Option<DateTime<Utc>>,
}

impl CacheElement {
    /// Creates a raw-byte element.
    pub fn new(
        key: impl Into<String>,
        value: Bytes,
        created_at: DateTime<Utc>,
        expiration: Option<DateTime<Utc>>,
    ) -> Self {
        CacheElement {
            key: key.into(),
            type_name: None,
            value,
            created_at,
            expiration,
        }
    }

    /// Creates an element carrying a logical type tag.
    pub fn typed(
        key: impl Into<String>,
        type_name: impl Into<String>,
        value: Bytes,
        created_at: DateTime<Utc>,
        expiration: Option<DateTime<Utc>>,
    ) -> Self {
        CacheElement {
            key: key.into(),
            type_name: Some(type_name.into()),
            value,
            created_at,
            expiration,
        }
    }

    /// Whether this element is expired at `now`.
    ///
    /// An entry inserted already-expired is immediately invisible to reads.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_expiring_element_is_never_expired() {
        let element = CacheElement::new("k", Bytes::from_static(b"v"), Utc::now(), None);
        assert!(!element.is_expired(Utc::now() + chrono::Duration::days(10_000)));
    }

    #[test]
    fn expiration_is_exclusive_at_the_boundary() {
        let now = Utc::now();
        let element = CacheElement::new("k", Bytes::new(), now, Some(now));
        // expiration == now is still visible; only strictly-past entries expire.
        assert!(!element.is_expired(now));
        assert!(element.is_expired(now + chrono::Duration::nanoseconds(100)));
    }

    #[test]
    fn typed_constructor_carries_the_tag() {
        let element =
            CacheElement::typed("k", "crate::Foo", Bytes::from_static(b"{}"), Utc::now(), None);
        assert_eq!(element.type_name.as_deref(), Some("crate::Foo"));
    }
}
