//! Adapters that live inside the domain crate for convenience.
//!
//! The in-memory stores back unit tests and the `memory` storage provider of
//! the api-server. Durable adapters live in separate crates.

pub mod memory_repo;
