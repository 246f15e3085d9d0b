//! Argument validation shared by every backend.

use crate::element::CacheElement;
use crate::error::{CacheError, CacheResult};

/// Rejects empty keys.
pub fn key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        Err(CacheError::ArgumentInvalid("key must not be empty"))
    } else {
        Ok(())
    }
}

/// Rejects key lists containing an empty key.
pub fn keys(keys: &[String]) -> CacheResult<()> {
    for k in keys {
        key(k)?;
    }
    Ok(())
}

/// Rejects elements with an empty key or an empty type tag.
pub fn elements(elements: &[CacheElement]) -> CacheResult<()> {
    for element in elements {
        key(&element.key)?;
        if element.type_name.as_deref() == Some("") {
            return Err(CacheError::ArgumentInvalid("type name must not be empty"));
        }
    }
    Ok(())
}

/// Rejects type-name lists containing an empty name.
pub fn type_names(names: &[String]) -> CacheResult<()> {
    for name in names {
        if name.is_empty() {
            return Err(CacheError::ArgumentInvalid("type name must not be empty"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(key(""), Err(CacheError::ArgumentInvalid(_))));
        assert!(key("k").is_ok());
    }

    #[test]
    fn element_keys_are_checked() {
        let bad = CacheElement::new("", Bytes::new(), Utc::now(), None);
        assert!(elements(&[bad]).is_err());
    }
}
