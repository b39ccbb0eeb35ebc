//! Coffer: an embedded persistent-object coordinator
//!
//! Coffer keeps a graph of typed objects in one or more local stores and
//! provides:
//! - **Stable identities**: every object gets a permanent [`ObjectId`] that
//!   survives restarts and resolves in any context
//! - **Serial edits**: all mutations run one at a time on a dedicated writer
//!   thread, each in a fresh scoped [`Context`]
//! - **Change notification**: typed [`ChangeSet`]s for subscribers, and
//!   automatic merging into long-lived contexts
//! - **History reconciliation**: folding writes made by other processes
//!   into the same change stream
//! - **Migrations**: versioned schemas with copy, swap and rollback
//!
//! # Quick Start
//!
//! ```no_run
//! use coffer::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let schema = SchemaModel::new(1).with_entity(
//!     "Note",
//!     EntitySchema::new()
//!         .with_attribute("title", AttributeSchema::required(AttributeKind::Text)),
//! );
//! let config = CoordinatorConfig::new(vec![StoreDescriptor::local_data("./data", "Default")]);
//! let coordinator = Coordinator::open(config, SchemaCatalog::single(schema))?;
//!
//! let mut notes = coordinator.subscribe(["Note"]);
//! let id = coordinator
//!     .edit(|ctx| {
//!         let note = ctx.insert("Note", attrs! { "title" => "hello" })?;
//!         ctx.identity_of(note)
//!     })
//!     .await?;
//!
//! let change = notes.next().await;
//! let title = coordinator
//!     .fetch_with(id, |ctx, note| ctx.attribute(note, "title"))
//!     .await?;
//! # let _ = (change, title);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod coordinator;
pub mod edit_queue;
pub mod migration;
pub mod notifier;
pub mod pool;
pub mod prelude;
pub mod reconciler;
pub mod remote;
pub mod stores;
pub mod token_table;
pub mod writer;

// Re-export core types
pub use coffer_core::{
    attrs,
    config::{
        CoordinatorConfig, MigrationPolicy, ReconcilerConfig, StorageKind, StoreDescriptor,
        SynchronousMode,
    },
    error::{CofferError, Result},
    schema::{
        AttributeKind, AttributeMapping, AttributeSchema, EntityMapping, EntitySchema,
        MappingModel, SchemaCatalog, SchemaModel,
    },
    traits::{AttributeFilter, ObjectStore, TokenTable},
    types::{
        Attributes, ChangeKind, ChangeSet, HistoryToken, ObjectId, StoreIdentity, StoreMetadata,
        StoredObject, Value,
    },
    LockManager, MemoryObjectStore,
};

// Re-export implementations
pub use coffer_sqlite::SqliteObjectStore;

// Re-export main types from this crate
pub use context::{Context, ContextId, Handle, MergeReport};
pub use coordinator::Coordinator;
pub use migration::{MigrationManager, MigrationReport};
pub use notifier::{ChangeStream, ExternalChangeNotice};
pub use reconciler::ReconcileOutcome;
pub use remote::RemoteWriter;
pub use token_table::{FileTokenTable, MemoryTokenTable};
