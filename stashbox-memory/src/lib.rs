#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod cache;

pub use cache::{InMemoryCache, InMemoryCacheBuilder};
