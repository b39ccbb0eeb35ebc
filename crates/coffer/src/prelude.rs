//! Coffer Prelude
//!
//! Import this to get all commonly used types and traits:
//!
//! ```
//! use coffer::prelude::*;
//! ```

// Core types
pub use crate::{
    attrs, Attributes, ChangeSet, CofferError, Coordinator, HistoryToken, ObjectId, Result,
    StoreIdentity, Value,
};

// Contexts
pub use crate::{Context, Handle, MergeReport};

// Configs
pub use crate::{
    CoordinatorConfig, MigrationPolicy, ReconcilerConfig, StorageKind, StoreDescriptor,
    SynchronousMode,
};

// Schemas
pub use crate::{AttributeKind, AttributeSchema, EntitySchema, MappingModel, SchemaCatalog, SchemaModel};

// Notifications and reconciliation
pub use crate::{ChangeStream, ExternalChangeNotice, ReconcileOutcome};

// Traits
pub use crate::{ObjectStore, TokenTable};

// Re-export common external deps
pub use anyhow;
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
pub use tracing;
