use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CofferError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Identity did not resolve in the requested scope. Expected, non-fatal.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Object {0} was removed from this context")]
    ObjectRemoved(String),

    #[error("Handle belongs to context {handle_context}, used in context {context}")]
    ForeignHandle { handle_context: u64, context: u64 },

    /// Closure-level failure, local to one edit or fetch.
    #[error("Operation failed: {0}")]
    Operation(String),

    /// The store rejected a commit; effects were rolled back.
    #[error("Save failed: {0}")]
    Save(String),

    #[error("Migration from v{from} to v{to} failed: {reason}")]
    MigrationStep { from: u32, to: u32, reason: String },

    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    #[error("History fetch failed: {0}")]
    HistoryFetch(String),

    #[error("Store is read-only: {0}")]
    ReadOnly(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Coordinator has been shut down")]
    Closed,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl CofferError {
    /// Resolution misses are a normal outcome, not a failure of the coordinator.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CofferError::NotFound(_))
    }

    /// Errors that must block store availability until an operator intervenes.
    pub fn is_fatal_for_store(&self) -> bool {
        matches!(
            self,
            CofferError::MigrationStep { .. } | CofferError::UnknownSchema(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CofferError>;

// Custom error types from edit/fetch closures flow through `Other`:
//
// #[derive(thiserror::Error, Debug)]
// enum InventoryError {
//     #[error("out of stock: {0}")]
//     OutOfStock(String),
// }
//
// coordinator.edit_sync(|ctx| {
//     Err(anyhow::Error::from(InventoryError::OutOfStock("widget".into())).into())
// })
