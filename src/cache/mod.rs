//! Cache-aside reads over the retrieval engine.
//!
//! Rows are cached in the key-value store under `namespace:id`, where `id` is the joined
//! key (or its grouped prefix). Hits are validated against the requested columns and
//! conditions before they are trusted; everything else is resolved with one batched
//! store query and written back.

mod aside;
mod config;

pub use aside::{CacheAside, FetchOptions, FetchRequest, Lookup};
pub use config::{CacheConfig, ConditionMissPolicy};
