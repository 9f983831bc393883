//! # chatmesh-store
//!
//! Durable key/value document storage for the tracker.
//!
//! A document is a JSON object stored under a name (`"users"`, `"rooms"`).
//! [`DocumentStore`] is the only interface the registries see; [`Database`]
//! backs it with SQLite and [`MemoryStore`] keeps everything in process for
//! tests and throwaway trackers.

pub mod database;
pub mod documents;
pub mod memory;

mod error;
mod schema;

pub use database::Database;
pub use documents::{load_typed, save_typed, Document, DocumentStore};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
