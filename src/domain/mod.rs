//! Domain types shared by the retrieval, cache and coordination layers.

pub mod condition;
pub mod entry;
pub mod error;
pub mod key;
pub mod keyed;
pub mod record;
pub mod task;
