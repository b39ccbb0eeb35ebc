pub mod coordinator;
pub mod descriptor;

pub use coordinator::{CoordinatorConfig, ReconcilerConfig};
pub use descriptor::{
    MigrationPolicy, StorageKind, StoreDescriptor, SynchronousMode, DEFAULT_CONFIGURATION,
    OPTION_HISTORY_TRACKING, OPTION_MIGRATION_POLICY, OPTION_SYNCHRONOUS,
};
