use crate::config::StoreDescriptor;
use crate::error::Result;
use crate::types::{
    Attributes, CommitInfo, HistoryToken, HistoryTransaction, ObjectId, StoreCommit, StoreIdentity,
    StoreMetadata, StoredObject, Value,
};

/// Native lookup predicate. Anything richer is composed by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeFilter {
    All,
    Equals { attribute: String, value: Value },
}

impl AttributeFilter {
    pub fn equals(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        AttributeFilter::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, object: &StoredObject) -> bool {
        self.matches_attributes(&object.attributes)
    }

    pub fn matches_attributes(&self, attributes: &Attributes) -> bool {
        match self {
            AttributeFilter::All => true,
            AttributeFilter::Equals { attribute, value } => attributes
                .get(attribute)
                .map(|v| v.same_as(value))
                .unwrap_or_else(|| value.is_null()),
        }
    }
}

/// Physical object store: durable objects, a key allocator and an
/// append-only history log.
///
/// Provides:
/// - Atomic multi-object commits, each recorded as one history transaction
/// - Concurrent reads that never block the writer
/// - A persisted, monotonic key allocator for permanent identities
pub trait ObjectStore: Send + Sync {
    fn identity(&self) -> StoreIdentity;

    fn descriptor(&self) -> &StoreDescriptor;

    fn metadata(&self) -> Result<StoreMetadata>;

    /// Current state of one object, None if it does not exist.
    fn load(&self, id: &ObjectId) -> Result<Option<StoredObject>>;

    /// Every object of `entity` matching `filter`, in key order.
    fn fetch(&self, entity: &str, filter: &AttributeFilter) -> Result<Vec<StoredObject>>;

    /// Reserve `count` consecutive keys and return the first. Reserved keys
    /// are never handed out again, even if the reserving save fails.
    fn allocate_keys(&self, count: u64) -> Result<u64>;

    /// Apply inserts, updates and deletes atomically.
    ///
    /// Inserting an existing id or updating a missing one fails the whole
    /// commit with `Save`. Deleting a missing id is ignored.
    fn commit(&self, commit: StoreCommit) -> Result<CommitInfo>;

    /// History transactions strictly after `after` (all when None), in
    /// token order.
    fn history_after(&self, after: Option<HistoryToken>) -> Result<Vec<HistoryTransaction>>;

    /// Delete history rows with token <= `up_to`. Returns rows removed.
    fn prune_history(&self, up_to: HistoryToken) -> Result<usize>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
