//! Open physical stores and route entities to them

use crate::migration::{erase_store, MigrationManager};
use coffer_core::{
    config::StoreDescriptor,
    error::{CofferError, Result},
    memory::MemoryObjectStore,
    schema::{EntitySchema, SchemaCatalog, SchemaModel},
    traits::ObjectStore,
    types::StoreIdentity,
};
use coffer_sqlite::{SqliteObjectStore, StoreFiles};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Every open store of one coordinator, plus the schema used to route
/// entities to their configuration.
pub struct StoreSet {
    stores: Vec<Arc<dyn ObjectStore>>,
    by_configuration: HashMap<String, usize>,
    by_identity: HashMap<StoreIdentity, usize>,
    schema: Arc<SchemaModel>,
}

impl StoreSet {
    pub fn new(stores: Vec<Arc<dyn ObjectStore>>, schema: Arc<SchemaModel>) -> Result<Self> {
        if stores.is_empty() {
            return Err(CofferError::Config("No stores configured".into()));
        }

        let mut by_configuration = HashMap::new();
        let mut by_identity = HashMap::new();
        for (idx, store) in stores.iter().enumerate() {
            let name = store.descriptor().configuration_name.clone();
            if by_configuration.insert(name.clone(), idx).is_some() {
                return Err(CofferError::Config(format!(
                    "Duplicate configuration name: {name}"
                )));
            }
            if by_identity.insert(store.identity(), idx).is_some() {
                return Err(CofferError::Config(format!(
                    "Store {} is configured twice",
                    store.identity()
                )));
            }
        }

        Ok(Self {
            stores,
            by_configuration,
            by_identity,
            schema,
        })
    }

    pub fn schema(&self) -> &SchemaModel {
        &self.schema
    }

    pub fn entity_schema(&self, entity: &str) -> Result<&EntitySchema> {
        self.schema.entity(entity)
    }

    /// Store holding `entity`: the one named by the entity's configuration,
    /// or the first store when that configuration is not open.
    pub fn for_entity(&self, entity: &str) -> Result<&Arc<dyn ObjectStore>> {
        let configuration = self.entity_schema(entity)?.configuration_name();
        let idx = self
            .by_configuration
            .get(configuration)
            .copied()
            .unwrap_or(0);
        Ok(&self.stores[idx])
    }

    pub fn by_identity(&self, identity: &StoreIdentity) -> Option<&Arc<dyn ObjectStore>> {
        self.by_identity.get(identity).map(|&idx| &self.stores[idx])
    }

    pub fn by_configuration(&self, name: &str) -> Option<&Arc<dyn ObjectStore>> {
        self.by_configuration.get(name).map(|&idx| &self.stores[idx])
    }

    pub fn identities(&self) -> Vec<StoreIdentity> {
        self.stores.iter().map(|s| s.identity()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ObjectStore>> {
        self.stores.iter()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// Open one store at the catalog's latest version.
///
/// On-disk stores first recover from an interrupted swap, then migrate
/// according to their policy. The opened store must report exactly the
/// latest version.
pub fn open_store(
    descriptor: &StoreDescriptor,
    catalog: &SchemaCatalog,
    migrations: &MigrationManager,
    read_pool_size: usize,
) -> Result<Arc<dyn ObjectStore>> {
    let latest = catalog.latest()?.version;
    if descriptor.is_in_memory() {
        return Ok(Arc::new(MemoryObjectStore::new(descriptor.clone(), latest)));
    }

    if !descriptor.read_only {
        let report = migrations.migrate(descriptor)?;
        if !report.steps.is_empty() {
            info!(
                "Store '{}' migrated v{} -> v{}",
                descriptor.configuration_name, report.from, report.to
            );
        }
    }

    let store = SqliteObjectStore::open(descriptor.clone(), latest, read_pool_size)?;
    let version = store.metadata()?.schema_version;
    if version != latest {
        return Err(CofferError::UnknownSchema(format!(
            "Store '{}' is at v{}, expected v{}",
            descriptor.configuration_name, version, latest
        )));
    }
    Ok(Arc::new(store))
}

/// Run `open`, and if it fails on a store marked `delete_on_open_failure`,
/// erase the store's files and try exactly once more.
pub fn open_with_recovery<F>(descriptor: &StoreDescriptor, mut open: F) -> Result<Arc<dyn ObjectStore>>
where
    F: FnMut(&StoreDescriptor) -> Result<Arc<dyn ObjectStore>>,
{
    let err = match open(descriptor) {
        Ok(store) => return Ok(store),
        Err(e) => e,
    };

    let recreatable =
        descriptor.delete_on_open_failure && !descriptor.is_in_memory() && !descriptor.read_only;
    if !recreatable {
        error!(
            "Failed to open store '{}': {}",
            descriptor.configuration_name, err
        );
        return Err(err);
    }

    warn!(
        "Failed to open store '{}' ({}), erasing and recreating",
        descriptor.configuration_name, err
    );
    erase_store(&StoreFiles::new(&descriptor.location))?;
    open(descriptor).map_err(|e| {
        error!(
            "Recreated store '{}' failed to open: {}",
            descriptor.configuration_name, e
        );
        e
    })
}
