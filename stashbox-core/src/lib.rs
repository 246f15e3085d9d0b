#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod cache;
pub mod element;
pub mod error;
pub mod serializer;
pub mod shutdown;
pub mod storable;
pub mod time;
pub mod transform;
pub mod validate;

pub use cache::{BlobCache, Clock, ObjectCache, system_clock};
pub use element::CacheElement;
pub use error::{CacheError, CacheResult, SharedError};
pub use serializer::{DateTimeKind, Serializer, SerializerSettings};
pub use shutdown::ShutdownSignal;
pub use storable::{Storable, type_name_of};
pub use transform::{IdentityTransform, PayloadTransform};

/// Raw byte payload type used for cached values.
///
/// `Bytes` makes cloning a reference-count bump, which is what keeps
/// fanning one batched query result out to many waiters cheap.
pub type Raw = bytes::Bytes;
