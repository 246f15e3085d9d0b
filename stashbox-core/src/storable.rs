//! Serialization bound for values stored through the typed-object API.

use serde::{Serialize, de::DeserializeOwned};

/// Trait that abstracts serialization requirements for typed cached values.
///
/// Blanket-implemented for every type meeting the serde bounds; users never
/// implement it by hand.
pub trait Storable: Serialize + DeserializeOwned + Send + Sync {}

impl<T> Storable for T where T: Serialize + DeserializeOwned + Send + Sync {}

/// The fully-qualified logical type name recorded for typed entries.
pub fn type_name_of<T>() -> &'static str {
    std::any::type_name::<T>()
}
