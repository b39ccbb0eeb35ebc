//! SQLite-backed physical object store
//!
//! Persists objects, the key allocator and the history log of one coffer
//! store in a single SQLite database.
//!
//! Key features:
//! - WAL mode with a pool of read-only connections
//! - Atomic multi-object commits, each recorded as one history transaction
//! - AUTOINCREMENT history tokens that stay monotonic across pruning
//! - Mapped copies and in-place rewrites for schema migration

pub mod files;
pub mod migrate;
pub mod read_pool;
pub mod schema;
pub mod store;

pub use files::StoreFiles;
pub use migrate::{copy_mapped, migrate_in_place, CopyStats};
pub use read_pool::SqliteReadPool;
pub use store::{checkpoint, read_metadata, SqliteObjectStore};
