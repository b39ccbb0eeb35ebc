//! Coffer Core: Traits and types for the coffer object coordinator
//!
//! This crate defines the core abstractions shared by the store backends
//! and the coordinator:
//! - Stable identities (`ObjectId`) and attribute values
//! - Physical store trait: objects, key allocator, history log
//! - Change sets produced by saves and by history reconciliation
//! - Versioned schema models and migration mappings
//! - Store descriptors and coordinator configuration
//!
//! Key features:
//! - Permanent identities: keys are allocated once and never reused
//! - Delete-wins folding of change histories
//! - Contiguous schema chains with inferred or explicit step mappings

pub mod codec;
pub mod config;
pub mod error;
pub mod lock_manager;
pub mod memory;
pub mod observe;
pub mod schema;
pub mod traits;
pub mod types;

pub use codec::{JsonCodec, ValueCodec};
pub use config::{
    CoordinatorConfig, MigrationPolicy, ReconcilerConfig, StorageKind, StoreDescriptor,
    SynchronousMode,
};
pub use error::{CofferError, Result};
pub use lock_manager::LockManager;
pub use memory::MemoryObjectStore;
pub use schema::{
    AttributeKind, AttributeMapping, AttributeSchema, EntityMapping, EntitySchema, MappingModel,
    SchemaCatalog, SchemaModel,
};
pub use traits::{token_key, AttributeFilter, ObjectStore, TokenTable};
pub use types::{
    Attributes, ChangeKind, ChangeSet, CommitInfo, HistoryChange, HistoryToken,
    HistoryTransaction, ObjectId, ObjectUpdate, StoreCommit, StoreIdentity, StoreMetadata,
    StoredObject, Value,
};
