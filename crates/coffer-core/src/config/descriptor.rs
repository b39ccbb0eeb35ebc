use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Configuration name used when a schema entity names none.
pub const DEFAULT_CONFIGURATION: &str = "Default";

/// Option key selecting [`MigrationPolicy`]
pub const OPTION_MIGRATION_POLICY: &str = "migration_policy";

/// Option key toggling the history log (bool, default true)
pub const OPTION_HISTORY_TRACKING: &str = "history_tracking";

/// Option key selecting [`SynchronousMode`] for on-disk stores
pub const OPTION_SYNCHRONOUS: &str = "synchronous";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    OnDisk,
    InMemory,
}

/// How a store whose on-disk version lags the program's schema is brought
/// up to date.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPolicy {
    /// Versioned step-by-step migration with backup and swap
    #[default]
    Explicit,
    /// Inferred in-place migration inside one store transaction
    Automatic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SynchronousMode {
    /// Full fsync (safest, slowest)
    Full,
    /// fsync at critical moments (good balance)
    #[default]
    Normal,
    /// No fsync (fastest, least safe)
    Off,
}

/// Describes one physical store the coordinator manages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreDescriptor {
    /// Path of the store's main file. Ignored for in-memory stores.
    #[serde(default)]
    pub location: PathBuf,

    #[serde(default)]
    pub storage_kind: StorageKind,

    /// Partition name; schema entities are routed to the store whose
    /// configuration they name.
    #[serde(default = "default_configuration")]
    pub configuration_name: String,

    #[serde(default)]
    pub read_only: bool,

    /// Erase and recreate the store once if it fails to open
    #[serde(default)]
    pub delete_on_open_failure: bool,

    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

fn default_configuration() -> String {
    DEFAULT_CONFIGURATION.to_string()
}

impl StoreDescriptor {
    pub fn on_disk(location: impl Into<PathBuf>, configuration_name: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            storage_kind: StorageKind::OnDisk,
            configuration_name: configuration_name.into(),
            read_only: false,
            delete_on_open_failure: false,
            options: BTreeMap::new(),
        }
    }

    pub fn in_memory(configuration_name: impl Into<String>) -> Self {
        Self {
            location: PathBuf::new(),
            storage_kind: StorageKind::InMemory,
            configuration_name: configuration_name.into(),
            read_only: false,
            delete_on_open_failure: false,
            options: BTreeMap::new(),
        }
    }

    /// `<dir>/<name>.sqlite`
    pub fn local_data(dir: impl AsRef<Path>, configuration_name: impl Into<String>) -> Self {
        let name = configuration_name.into();
        Self::on_disk(dir.as_ref().join(format!("{name}.sqlite")), name)
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_delete_on_open_failure(mut self, enabled: bool) -> Self {
        self.delete_on_open_failure = enabled;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_migration_policy(self, policy: MigrationPolicy) -> Self {
        let value = serde_json::to_value(policy).unwrap_or(serde_json::Value::Null);
        self.with_option(OPTION_MIGRATION_POLICY, value)
    }

    pub fn with_history_tracking(self, enabled: bool) -> Self {
        self.with_option(OPTION_HISTORY_TRACKING, serde_json::Value::Bool(enabled))
    }

    pub fn with_synchronous(self, mode: SynchronousMode) -> Self {
        let value = serde_json::to_value(mode).unwrap_or(serde_json::Value::Null);
        self.with_option(OPTION_SYNCHRONOUS, value)
    }

    /// Unknown or malformed values fall back to the default.
    pub fn migration_policy(&self) -> MigrationPolicy {
        self.typed_option(OPTION_MIGRATION_POLICY).unwrap_or_default()
    }

    pub fn history_tracking(&self) -> bool {
        self.typed_option(OPTION_HISTORY_TRACKING).unwrap_or(true)
    }

    pub fn synchronous(&self) -> SynchronousMode {
        self.typed_option(OPTION_SYNCHRONOUS).unwrap_or_default()
    }

    pub fn is_in_memory(&self) -> bool {
        self.storage_kind == StorageKind::InMemory
    }

    fn typed_option<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.options
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_helpers() {
        let desc = StoreDescriptor::in_memory("Cloud");
        assert_eq!(desc.migration_policy(), MigrationPolicy::Explicit);
        assert!(desc.history_tracking());

        let desc = desc
            .with_migration_policy(MigrationPolicy::Automatic)
            .with_history_tracking(false);
        assert_eq!(desc.migration_policy(), MigrationPolicy::Automatic);
        assert!(!desc.history_tracking());
    }

    #[test]
    fn test_malformed_option_falls_back() {
        let desc = StoreDescriptor::in_memory("Local")
            .with_option(OPTION_MIGRATION_POLICY, serde_json::json!("sideways"));
        assert_eq!(desc.migration_policy(), MigrationPolicy::Explicit);
    }

    #[test]
    fn test_deserialize_defaults() {
        let desc: StoreDescriptor =
            serde_json::from_str(r#"{"location": "/tmp/a.sqlite"}"#).unwrap();
        assert_eq!(desc.configuration_name, DEFAULT_CONFIGURATION);
        assert_eq!(desc.storage_kind, StorageKind::OnDisk);
        assert!(!desc.delete_on_open_failure);
    }
}
