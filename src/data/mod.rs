//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite-backed activity/object store
//! - JSON-LD-ish normalization helpers

mod models;
pub mod normalize;
mod store;

pub use models::*;
pub use store::Store;
