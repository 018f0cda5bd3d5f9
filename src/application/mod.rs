//! Application layer: store contracts and the keyed retrieval engine.

pub mod diagnostics;
pub mod error;
pub mod repos;
pub mod retrieval;
pub mod token;
