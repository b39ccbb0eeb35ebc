use crate::error::{CofferError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const URI_SCHEME: &str = "coffer://";

/// Identity of one physical store, generated when the store file is created
/// and persisted in its metadata.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreIdentity(String);

impl StoreIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh random identity for a newly created store.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable, store-scoped object identity.
///
/// An `ObjectId` is handed out exactly once by the owning store's key
/// allocator and is never reassigned or reused. It is the only thing that
/// may cross a context boundary: live handles are bound to the context that
/// produced them, and other contexts re-resolve through the id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    store: StoreIdentity,
    entity: String,
    key: u64,
}

impl ObjectId {
    pub fn new(store: StoreIdentity, entity: impl Into<String>, key: u64) -> Self {
        Self {
            store,
            entity: entity.into(),
            key,
        }
    }

    pub fn store(&self) -> &StoreIdentity {
        &self.store
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// Same store and key under a different entity name (entity renames
    /// during migration keep the key).
    pub fn with_entity(&self, entity: impl Into<String>) -> Self {
        Self {
            store: self.store.clone(),
            entity: entity.into(),
            key: self.key,
        }
    }

    /// `coffer://<store>/<Entity>/p<key>`
    pub fn to_uri(&self) -> String {
        format!("{}{}/{}/p{}", URI_SCHEME, self.store, self.entity, self.key)
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        let invalid = || CofferError::Serialization(format!("Invalid object URI: {uri}"));

        let rest = uri.strip_prefix(URI_SCHEME).ok_or_else(invalid)?;
        let mut parts = rest.split('/');
        let store = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let entity = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let key = parts
            .next()
            .and_then(|k| k.strip_prefix('p'))
            .and_then(|k| k.parse::<u64>().ok())
            .ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::new(StoreIdentity::new(store), entity, key))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}
