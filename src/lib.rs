//! Layerkeep - build-cache storage for a single build worker
//!
//! Content-addressable blobs, a snapshot tree built from them, and a
//! lease-scoped garbage collector that reclaims whatever no build holds.

pub mod cli;
pub mod config;
pub mod content;
pub mod digest;
pub mod error;
pub mod executor;
pub mod gc;
pub mod index;
pub mod lease;
pub mod locks;
pub mod metadata;
mod persist;
pub mod snapshot;
pub mod worker;

pub use error::{LayerkeepError, LayerkeepResult};
pub use worker::Worker;
