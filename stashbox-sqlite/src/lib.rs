#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod cache;
mod queue;
mod schema;

pub use cache::{SqliteCache, SqliteCacheBuilder};
pub use queue::QueueStats;
pub use schema::SCHEMA_VERSION;
