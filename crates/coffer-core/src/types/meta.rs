use crate::types::history::HistoryToken;
use crate::types::object::{ObjectUpdate, StoredObject};
use crate::types::object_id::{ObjectId, StoreIdentity};
use serde::{Deserialize, Serialize};

/// Metadata persisted inside every physical store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub store_identity: StoreIdentity,

    /// Schema version of every object in the store
    pub schema_version: u32,

    /// Next key the allocator will hand out
    pub next_key: u64,

    /// Creation timestamp (RFC 3339)
    pub created_at: String,

    /// Last updated timestamp (RFC 3339)
    pub updated_at: String,
}

impl StoreMetadata {
    pub fn new(schema_version: u32) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            store_identity: StoreIdentity::generate(),
            schema_version,
            next_key: 1,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Everything one save writes to one store, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct StoreCommit {
    /// Recorded in the history log and used to tell local from remote writes
    pub author: String,
    pub inserts: Vec<StoredObject>,
    pub updates: Vec<ObjectUpdate>,
    pub deletes: Vec<ObjectId>,
}

impl StoreCommit {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, Default)]
pub struct CommitInfo {
    /// History row written for the commit (None when tracking is disabled)
    pub token: Option<HistoryToken>,

    /// Post-commit state of every inserted or updated object
    pub objects: Vec<StoredObject>,

    /// Updated ids whose stored attributes actually changed
    pub changed: Vec<ObjectId>,

    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}
