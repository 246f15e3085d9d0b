//! Enveloped JSON payload codec for the typed-object operations.
//!
//! Values are encoded as a single-field record `{"Value": T}`. The envelope
//! is what lets primitives and nullable values round-trip at the root of
//! the document. Decoding tries the envelope first and falls back to the
//! bare legacy layout written by older versions.

use bytes::Bytes;
use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::error::{CacheError, CacheResult};

/// Date-time kind forced onto offset-less datetime strings during decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimeKind {
    /// Interpret offset-less datetimes in the local time zone.
    Local,
    /// Interpret offset-less datetimes as UTC.
    Utc,
}

/// Application-provided serializer configuration, passed through unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerializerSettings {
    /// When set, offset-less datetime strings are coerced to this kind on
    /// decode so `DateTime` values survive round-trips with a consistent
    /// kind regardless of backend defaults.
    pub forced_date_time_kind: Option<DateTimeKind>,
}

/// Converts typed values to and from the self-describing byte payload.
#[derive(Debug, Clone, Default)]
pub struct Serializer {
    settings: SerializerSettings,
}

/// Process-wide default serializer used when a cache has no explicit one.
pub(crate) static DEFAULT_SERIALIZER: Serializer = Serializer {
    settings: SerializerSettings {
        forced_date_time_kind: None,
    },
};

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "Value")]
    value: T,
}

impl Serializer {
    /// Creates a serializer with the given settings.
    pub fn new(settings: SerializerSettings) -> Self {
        Serializer { settings }
    }

    /// Returns the configured settings.
    pub fn settings(&self) -> &SerializerSettings {
        &self.settings
    }

    /// Encodes a value into its enveloped payload.
    pub fn serialize<T: Serialize>(&self, value: &T) -> CacheResult<Bytes> {
        serde_json::to_vec(&Envelope { value })
            .map(Bytes::from)
            .map_err(CacheError::serialization)
    }

    /// Decodes a payload, preferring the envelope and falling back to the
    /// bare legacy layout.
    pub fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> CacheResult<T> {
        let mut tree: serde_json::Value =
            serde_json::from_slice(payload).map_err(CacheError::serialization)?;

        if let Some(kind) = self.settings.forced_date_time_kind {
            coerce_date_time_kind(&mut tree, kind);
        }

        let is_envelope = tree
            .as_object()
            .is_some_and(|map| map.len() == 1 && map.contains_key("Value"));
        if is_envelope {
            let inner = tree
                .get("Value")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            match T::deserialize(inner) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(error = %err, "enveloped decode failed, retrying legacy layout");
                }
            }
        }

        T::deserialize(tree).map_err(CacheError::serialization)
    }
}

/// Rewrites offset-less datetime strings in the parsed tree so the typed
/// deserialization sees an explicit offset of the forced kind.
fn coerce_date_time_kind(value: &mut serde_json::Value, kind: DateTimeKind) {
    match value {
        serde_json::Value::String(s) => {
            if let Some(coerced) = coerce_string(s, kind) {
                *s = coerced;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                coerce_date_time_kind(item, kind);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                coerce_date_time_kind(item, kind);
            }
        }
        _ => {}
    }
}

fn coerce_string(s: &str, kind: DateTimeKind) -> Option<String> {
    // Only strings that parse as a datetime without an offset are touched;
    // anything carrying an offset (or not a datetime at all) passes through.
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    match kind {
        DateTimeKind::Utc => Some(Utc.from_utc_datetime(&naive).to_rfc3339()),
        DateTimeKind::Local => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.to_rfc3339()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Person {
        name: String,
        age: u32,
    }

    #[test]
    fn structs_round_trip() {
        let serializer = Serializer::default();
        let person = Person {
            name: "ada".into(),
            age: 36,
        };
        let payload = serializer.serialize(&person).unwrap();
        let decoded: Person = serializer.deserialize(&payload).unwrap();
        assert_eq!(decoded, person);
    }

    #[test]
    fn root_level_primitives_round_trip() {
        let serializer = Serializer::default();
        let payload = serializer.serialize(&42i64).unwrap();
        assert_eq!(serializer.deserialize::<i64>(&payload).unwrap(), 42);

        let payload = serializer.serialize(&None::<String>).unwrap();
        assert_eq!(serializer.deserialize::<Option<String>>(&payload).unwrap(), None);
    }

    #[test]
    fn payload_is_enveloped() {
        let serializer = Serializer::default();
        let payload = serializer.serialize(&7u8).unwrap();
        let tree: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(tree, serde_json::json!({ "Value": 7 }));
    }

    #[test]
    fn legacy_bare_payloads_still_decode() {
        let serializer = Serializer::default();
        let legacy = br#"{"name":"grace","age":45}"#;
        let decoded: Person = serializer.deserialize(legacy).unwrap();
        assert_eq!(decoded.name, "grace");
    }

    #[test]
    fn garbage_fails_with_serialization_error() {
        let serializer = Serializer::default();
        let result = serializer.deserialize::<Person>(b"not json at all");
        assert!(matches!(result, Err(CacheError::SerializationFailed(_))));
    }

    #[test]
    fn forced_utc_kind_coerces_offsetless_datetimes() {
        let serializer = Serializer::new(SerializerSettings {
            forced_date_time_kind: Some(DateTimeKind::Utc),
        });
        let payload = br#"{"Value":"2024-03-01T12:00:00"}"#;
        let decoded: DateTime<Utc> = serializer.deserialize(payload).unwrap();
        assert_eq!(decoded, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn explicit_offsets_are_left_alone() {
        let serializer = Serializer::new(SerializerSettings {
            forced_date_time_kind: Some(DateTimeKind::Utc),
        });
        let payload = br#"{"Value":"2024-03-01T12:00:00+02:00"}"#;
        let decoded: DateTime<Utc> = serializer.deserialize(payload).unwrap();
        assert_eq!(decoded, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn non_datetime_strings_are_untouched() {
        let serializer = Serializer::new(SerializerSettings {
            forced_date_time_kind: Some(DateTimeKind::Utc),
        });
        let payload = serializer.serialize(&"just a string").unwrap();
        let decoded: String = serializer.deserialize(&payload).unwrap();
        assert_eq!(decoded, "just a string");
    }
}
