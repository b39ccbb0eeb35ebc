use crate::types::object_id::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(ChangeKind::Insert),
            "update" => Some(ChangeKind::Update),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// Typed diff of one writer save or one reconciled history batch.
///
/// Serialized with the wire field names `changedTypes`, `inserted`,
/// `updated` and `deleted`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub changed_types: BTreeSet<String>,
    pub inserted: BTreeSet<ObjectId>,
    pub updated: BTreeSet<ObjectId>,
    pub deleted: BTreeSet<ObjectId>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one change. A delete removes the identity from the other
    /// buckets and later inserts/updates for it are ignored; an update of
    /// an identity inserted in the same set stays an insert.
    pub fn record(&mut self, id: ObjectId, kind: ChangeKind) {
        if self.deleted.contains(&id) {
            return;
        }
        self.changed_types.insert(id.entity().to_string());
        match kind {
            ChangeKind::Delete => {
                self.inserted.remove(&id);
                self.updated.remove(&id);
                self.deleted.insert(id);
            }
            ChangeKind::Insert => {
                self.updated.remove(&id);
                self.inserted.insert(id);
            }
            ChangeKind::Update => {
                if !self.inserted.contains(&id) {
                    self.updated.insert(id);
                }
            }
        }
    }

    /// Drop every identity whose entity starts with `prefix` and recompute
    /// `changed_types`. An empty prefix filters nothing.
    pub fn filter_system(mut self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self;
        }
        let keep = |id: &ObjectId| !id.entity().starts_with(prefix);
        self.inserted.retain(keep);
        self.updated.retain(keep);
        self.deleted.retain(keep);
        self.changed_types.retain(|t| !t.starts_with(prefix));
        self
    }

    /// True when no type changed; such a set is never published.
    pub fn is_empty(&self) -> bool {
        self.changed_types.is_empty()
    }

    /// True if `id` appears in any bucket.
    pub fn mentions(&self, id: &ObjectId) -> bool {
        self.inserted.contains(id) || self.updated.contains(id) || self.deleted.contains(id)
    }

    /// True if any of `types` changed. An empty filter matches everything.
    pub fn touches_any(&self, types: &BTreeSet<String>) -> bool {
        types.is_empty() || types.iter().any(|t| self.changed_types.contains(t))
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::object_id::StoreIdentity;

    fn id(entity: &str, key: u64) -> ObjectId {
        ObjectId::new(StoreIdentity::new("s"), entity, key)
    }

    #[test]
    fn test_delete_wins_regardless_of_order() {
        let mut set = ChangeSet::new();
        set.record(id("Note", 1), ChangeKind::Update);
        set.record(id("Note", 1), ChangeKind::Delete);
        set.record(id("Note", 1), ChangeKind::Update);

        assert!(set.deleted.contains(&id("Note", 1)));
        assert!(set.updated.is_empty());
        assert!(set.inserted.is_empty());
    }

    #[test]
    fn test_insert_then_update_stays_insert() {
        let mut set = ChangeSet::new();
        set.record(id("Note", 2), ChangeKind::Insert);
        set.record(id("Note", 2), ChangeKind::Update);
        assert_eq!(set.inserted.len(), 1);
        assert!(set.updated.is_empty());
    }

    #[test]
    fn test_filter_system_prefix() {
        let mut set = ChangeSet::new();
        set.record(id("_Tombstone", 1), ChangeKind::Insert);
        let set = set.filter_system("_");
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_wire_field_names() {
        let mut set = ChangeSet::new();
        set.record(id("Note", 3), ChangeKind::Insert);
        let json = serde_json::to_value(&set).unwrap();
        assert!(json.get("changedTypes").is_some());
        assert!(json.get("inserted").is_some());
    }
}
