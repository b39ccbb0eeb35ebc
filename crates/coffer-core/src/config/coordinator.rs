use super::descriptor::StoreDescriptor;
use crate::error::{CofferError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

/// Configuration for the history reconciler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Transactions written by these authors are folded into the token but
    /// never published. The coordinator's own writer author is always
    /// added unless `replay_local_saves` is set.
    #[serde(default)]
    pub exclude_authors: BTreeSet<String>,

    /// Publish local saves a second time when they show up in history
    /// (default: false)
    #[serde(default)]
    pub replay_local_saves: bool,
}

impl ReconcilerConfig {
    pub fn exclude_author(mut self, author: impl Into<String>) -> Self {
        self.exclude_authors.insert(author.into());
        self
    }

    pub fn with_local_replay(mut self, enabled: bool) -> Self {
        self.replay_local_saves = enabled;
        self
    }
}

/// Top-level coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub stores: Vec<StoreDescriptor>,

    /// JSON file holding persisted history tokens. `None` keeps tokens in
    /// memory only.
    #[serde(default)]
    pub token_table_path: Option<PathBuf>,

    /// Entities whose name starts with this prefix never appear in
    /// published change sets (default: "_")
    #[serde(default = "default_system_prefix")]
    pub system_type_prefix: String,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Read-only connections per on-disk store (default: 4)
    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: usize,

    /// Capacity of each subscriber stream and of the external-notice
    /// broadcast channel (default: 64). A subscriber that falls this far
    /// behind is dropped and its stream ends.
    #[serde(default = "default_notifier_capacity")]
    pub notifier_capacity: usize,

    /// Author recorded for saves made through the edit queue
    /// (default: "coffer.local")
    #[serde(default = "default_writer_author")]
    pub writer_author: String,
}

fn default_system_prefix() -> String {
    "_".to_string()
}

fn default_read_pool_size() -> usize {
    4
}

fn default_notifier_capacity() -> usize {
    64
}

fn default_writer_author() -> String {
    "coffer.local".to_string()
}

impl CoordinatorConfig {
    pub fn new(stores: Vec<StoreDescriptor>) -> Self {
        Self {
            stores,
            token_table_path: None,
            system_type_prefix: default_system_prefix(),
            reconciler: ReconcilerConfig::default(),
            read_pool_size: default_read_pool_size(),
            notifier_capacity: default_notifier_capacity(),
            writer_author: default_writer_author(),
        }
    }

    pub fn with_store(mut self, store: StoreDescriptor) -> Self {
        self.stores.push(store);
        self
    }

    pub fn with_token_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_table_path = Some(path.into());
        self
    }

    pub fn with_system_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.system_type_prefix = prefix.into();
        self
    }

    pub fn with_reconciler(mut self, reconciler: ReconcilerConfig) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_read_pool_size(mut self, size: usize) -> Self {
        self.read_pool_size = size;
        self
    }

    pub fn with_writer_author(mut self, author: impl Into<String>) -> Self {
        self.writer_author = author.into();
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| CofferError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Two descriptors may not claim the same partition or the same file.
    pub fn validate(&self) -> Result<()> {
        if self.stores.is_empty() {
            return Err(CofferError::Config("No stores configured".into()));
        }

        let mut names = HashSet::new();
        let mut locations = HashSet::new();
        for store in &self.stores {
            if !names.insert(store.configuration_name.as_str()) {
                return Err(CofferError::Config(format!(
                    "Duplicate configuration name: {}",
                    store.configuration_name
                )));
            }
            if !store.is_in_memory() && !locations.insert(store.location.as_path()) {
                return Err(CofferError::Config(format!(
                    "Duplicate store location: {}",
                    store.location.display()
                )));
            }
        }
        Ok(())
    }
}
