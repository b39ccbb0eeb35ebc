//! Versioned store migration
//!
//! Brings an on-disk store from its recorded schema version to the latest
//! version of a [`SchemaCatalog`], one step at a time. Each step writes a
//! migrated copy beside the store and swaps it in; a failed step leaves
//! the store exactly as it was before that step and aborts the chain.
//!
//! # Example
//!
//! ```no_run
//! use coffer::migration::MigrationManager;
//! use coffer::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let catalog = Arc::new(SchemaCatalog::load_dir("./schemas")?);
//! let manager = MigrationManager::new(catalog);
//!
//! let store = StoreDescriptor::on_disk("./data/notes.sqlite", "Default");
//! for version in manager.pending(&store)? {
//!     println!("pending: v{}", version);
//! }
//! manager.migrate(&store)?;
//! # Ok(())
//! # }
//! ```

mod swap;

pub use swap::{erase_store, recover_interrupted_swap, FileOps, StdFileOps};

use coffer_core::{
    codec::{JsonCodec, ValueCodec},
    config::{MigrationPolicy, StoreDescriptor},
    error::{CofferError, Result},
    observe,
    schema::SchemaCatalog,
};
use coffer_sqlite::{checkpoint, copy_mapped, migrate_in_place, read_metadata, StoreFiles};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Outcome of bringing one store up to date
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    /// Destination version of every step applied, in order
    pub steps: Vec<u32>,
}

impl MigrationReport {
    fn unchanged(version: u32) -> Self {
        Self {
            from: version,
            to: version,
            steps: Vec::new(),
        }
    }
}

/// Runs migration chains against on-disk stores.
pub struct MigrationManager {
    catalog: Arc<SchemaCatalog>,
    ops: Arc<dyn FileOps>,
    codec: Arc<dyn ValueCodec>,
}

impl MigrationManager {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self {
            catalog,
            ops: Arc::new(StdFileOps),
            codec: Arc::new(JsonCodec),
        }
    }

    /// Use custom file operations for the backup and swap
    pub fn with_file_ops(mut self, ops: Arc<dyn FileOps>) -> Self {
        self.ops = ops;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Versions a store would pass through to reach the latest version.
    /// Empty for new, in-memory and up-to-date stores.
    pub fn pending(&self, descriptor: &StoreDescriptor) -> Result<Vec<u32>> {
        let files = StoreFiles::new(&descriptor.location);
        if descriptor.is_in_memory() || !files.exists() {
            return Ok(Vec::new());
        }
        let current = read_metadata(files.main())?.schema_version;
        let target = self.catalog.latest()?.version;
        self.catalog.chain(current, target)
    }

    /// Recover from any interrupted swap, then migrate the store to the
    /// latest version using its migration policy.
    pub fn migrate(&self, descriptor: &StoreDescriptor) -> Result<MigrationReport> {
        let target = self.catalog.latest()?.version;
        let files = StoreFiles::new(&descriptor.location);
        if descriptor.is_in_memory() {
            return Ok(MigrationReport::unchanged(target));
        }

        recover_interrupted_swap(&files, self.ops.as_ref())?;
        if !files.exists() {
            return Ok(MigrationReport::unchanged(target));
        }

        let current = read_metadata(files.main())?.schema_version;
        if current == target {
            return Ok(MigrationReport::unchanged(current));
        }
        let chain = self.catalog.chain(current, target)?;

        info!(
            "Migrating store '{}' from v{} to v{} ({} steps)",
            descriptor.configuration_name,
            current,
            target,
            chain.len()
        );

        let mut report = MigrationReport {
            from: current,
            to: current,
            steps: Vec::new(),
        };
        for destination in chain {
            let from = destination - 1;
            let start = Instant::now();
            let result = match descriptor.migration_policy() {
                MigrationPolicy::Explicit => self.run_step(&files, from),
                MigrationPolicy::Automatic => self.run_in_place(&files, from),
            };
            observe::record_migration_step(start.elapsed(), result.is_ok());

            if let Err(e) = result {
                error!(
                    "Migration of '{}' v{} -> v{} failed: {}",
                    descriptor.configuration_name, from, destination, e
                );
                return Err(e);
            }
            info!("Applied migration v{} -> v{}", from, destination);
            report.to = destination;
            report.steps.push(destination);
        }

        Ok(report)
    }

    /// Copy-and-swap one step.
    fn run_step(&self, live: &StoreFiles, from: u32) -> Result<()> {
        let mapping = self.catalog.step_mapping(from)?;
        let step_err = |reason: String| CofferError::MigrationStep {
            from,
            to: mapping.destination_version,
            reason,
        };

        checkpoint(live.main()).map_err(|e| step_err(e.to_string()))?;

        let temp = live.temp();
        temp.remove()?;
        if let Err(e) = copy_mapped(live.main(), temp.main(), &mapping, self.codec.as_ref()) {
            let _ = temp.remove();
            return Err(match e {
                step @ CofferError::MigrationStep { .. } => step,
                other => step_err(other.to_string()),
            });
        }

        swap::swap_in(live, &temp, self.ops.as_ref()).map_err(|e| step_err(e.to_string()))
    }

    fn run_in_place(&self, live: &StoreFiles, from: u32) -> Result<()> {
        let mapping = self.catalog.step_mapping(from)?;
        migrate_in_place(live.main(), &mapping, self.codec.as_ref()).map_err(|e| match e {
            step @ CofferError::MigrationStep { .. } => step,
            other => CofferError::MigrationStep {
                from,
                to: mapping.destination_version,
                reason: other.to_string(),
            },
        })?;
        Ok(())
    }
}
