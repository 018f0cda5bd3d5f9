//! In-process stores backing tests and local experiments.

mod kv;
mod lock;
mod tables;

pub use kv::MemoryKv;
pub use tables::MemoryTables;
