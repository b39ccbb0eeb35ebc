//! In-memory object store
//!
//! Backs `StorageKind::InMemory` descriptors and unit tests. Contents live
//! for the lifetime of the value; locks are held only for one call.

use crate::config::StoreDescriptor;
use crate::error::{CofferError, Result};
use crate::traits::{AttributeFilter, ObjectStore};
use crate::types::{
    Attributes, ChangeKind, CommitInfo, HistoryChange, HistoryToken, HistoryTransaction, ObjectId,
    StoreCommit, StoreIdentity, StoreMetadata, StoredObject,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;

struct Inner {
    meta: StoreMetadata,
    /// (entity, key) -> (attributes, schema version)
    objects: BTreeMap<(String, u64), (Attributes, u32)>,
    history: Vec<HistoryTransaction>,
    next_token: u64,
}

pub struct MemoryObjectStore {
    descriptor: StoreDescriptor,
    inner: RwLock<Inner>,
}

impl MemoryObjectStore {
    pub fn new(descriptor: StoreDescriptor, schema_version: u32) -> Self {
        Self {
            descriptor,
            inner: RwLock::new(Inner {
                meta: StoreMetadata::new(schema_version),
                objects: BTreeMap::new(),
                history: Vec::new(),
                next_token: 1,
            }),
        }
    }

    /// Number of live objects across all entities
    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().objects.is_empty()
    }
}

fn row_key(id: &ObjectId) -> (String, u64) {
    (id.entity().to_string(), id.key())
}

impl ObjectStore for MemoryObjectStore {
    fn identity(&self) -> StoreIdentity {
        self.inner.read().meta.store_identity.clone()
    }

    fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    fn metadata(&self) -> Result<StoreMetadata> {
        Ok(self.inner.read().meta.clone())
    }

    fn load(&self, id: &ObjectId) -> Result<Option<StoredObject>> {
        let inner = self.inner.read();
        if id.store() != &inner.meta.store_identity {
            return Ok(None);
        }
        Ok(inner
            .objects
            .get(&row_key(id))
            .map(|(attributes, version)| StoredObject::new(id.clone(), attributes.clone(), *version)))
    }

    fn fetch(&self, entity: &str, filter: &AttributeFilter) -> Result<Vec<StoredObject>> {
        let inner = self.inner.read();
        let store = &inner.meta.store_identity;
        Ok(inner
            .objects
            .range((entity.to_string(), 0)..=(entity.to_string(), u64::MAX))
            .map(|((entity, key), (attributes, version))| {
                StoredObject::new(
                    ObjectId::new(store.clone(), entity.clone(), *key),
                    attributes.clone(),
                    *version,
                )
            })
            .filter(|object| filter.matches(object))
            .collect())
    }

    fn allocate_keys(&self, count: u64) -> Result<u64> {
        let mut inner = self.inner.write();
        let first = inner.meta.next_key;
        inner.meta.next_key += count;
        Ok(first)
    }

    fn commit(&self, commit: StoreCommit) -> Result<CommitInfo> {
        if self.descriptor.read_only {
            return Err(CofferError::ReadOnly(self.descriptor.configuration_name.clone()));
        }

        let mut inner = self.inner.write();
        let identity = inner.meta.store_identity.clone();

        // Validate everything before touching state so a rejected commit
        // leaves the store untouched.
        for object in &commit.inserts {
            if object.id.store() != &identity || inner.objects.contains_key(&row_key(&object.id)) {
                return Err(CofferError::Save(format!("{} already exists", object.id)));
            }
        }
        for update in &commit.updates {
            if !inner.objects.contains_key(&row_key(&update.id)) {
                return Err(CofferError::Save(format!("{} does not exist", update.id)));
            }
        }

        let mut info = CommitInfo::default();
        let mut changes = Vec::new();

        for object in commit.inserts {
            inner.objects.insert(
                row_key(&object.id),
                (object.attributes.clone(), object.schema_version),
            );
            changes.push(HistoryChange {
                id: object.id.clone(),
                kind: ChangeKind::Insert,
            });
            info.objects.push(object);
            info.inserted += 1;
        }

        for update in commit.updates {
            let Some((attributes, version)) = inner.objects.get_mut(&row_key(&update.id)) else {
                continue;
            };
            let before = attributes.clone();
            update.apply_to(attributes);
            if attributes.len() != before.len()
                || attributes.iter().any(|(k, v)| before.get(k).map_or(true, |b| !b.same_as(v)))
            {
                info.changed.push(update.id.clone());
            }
            changes.push(HistoryChange {
                id: update.id.clone(),
                kind: ChangeKind::Update,
            });
            info.objects
                .push(StoredObject::new(update.id, attributes.clone(), *version));
            info.updated += 1;
        }

        for id in commit.deletes {
            if inner.objects.remove(&row_key(&id)).is_some() {
                changes.push(HistoryChange {
                    id,
                    kind: ChangeKind::Delete,
                });
                info.deleted += 1;
            }
        }

        inner.meta.updated_at = chrono::Utc::now().to_rfc3339();

        if self.descriptor.history_tracking() && !changes.is_empty() {
            let token = HistoryToken(inner.next_token);
            inner.next_token += 1;
            inner.history.push(HistoryTransaction {
                token,
                author: commit.author,
                timestamp: chrono::Utc::now(),
                changes,
            });
            info.token = Some(token);
        }

        Ok(info)
    }

    fn history_after(&self, after: Option<HistoryToken>) -> Result<Vec<HistoryTransaction>> {
        let inner = self.inner.read();
        Ok(inner
            .history
            .iter()
            .filter(|tx| after.map_or(true, |t| tx.token > t))
            .cloned()
            .collect())
    }

    fn prune_history(&self, up_to: HistoryToken) -> Result<usize> {
        let mut inner = self.inner.write();
        let before = inner.history.len();
        inner.history.retain(|tx| tx.token > up_to);
        Ok(before - inner.history.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::types::ObjectUpdate;

    fn store() -> MemoryObjectStore {
        MemoryObjectStore::new(StoreDescriptor::in_memory("Local"), 1)
    }

    fn insert(store: &MemoryObjectStore, entity: &str, attributes: Attributes) -> ObjectId {
        let key = store.allocate_keys(1).unwrap();
        let id = ObjectId::new(store.identity(), entity, key);
        let mut commit = StoreCommit::new("test");
        commit
            .inserts
            .push(StoredObject::new(id.clone(), attributes, 1));
        store.commit(commit).unwrap();
        id
    }

    #[test]
    fn test_keys_are_never_reused() {
        let store = store();
        let a = store.allocate_keys(3).unwrap();
        let b = store.allocate_keys(1).unwrap();
        assert_eq!(b, a + 3);
    }

    #[test]
    fn test_rejected_commit_changes_nothing() {
        let store = store();
        let id = insert(&store, "Note", attrs! { "title" => "a" });

        let missing = ObjectId::new(store.identity(), "Note", 999);
        let mut commit = StoreCommit::new("test");
        commit.deletes.push(id.clone());
        commit
            .updates
            .push(ObjectUpdate::new(missing, attrs! { "title" => "b" }));

        assert!(matches!(store.commit(commit), Err(CofferError::Save(_))));
        assert!(store.load(&id).unwrap().is_some());
        assert_eq!(store.history_after(None).unwrap().len(), 1);
    }

    #[test]
    fn test_unchanged_update_not_reported_changed() {
        let store = store();
        let id = insert(&store, "Note", attrs! { "title" => "a" });

        let mut commit = StoreCommit::new("test");
        commit
            .updates
            .push(ObjectUpdate::new(id.clone(), attrs! { "title" => "a" }));
        let info = store.commit(commit).unwrap();
        assert_eq!(info.updated, 1);
        assert!(info.changed.is_empty());
    }

    #[test]
    fn test_history_after_and_prune() {
        let store = store();
        insert(&store, "Note", attrs! { "title" => "a" });
        insert(&store, "Note", attrs! { "title" => "b" });

        let all = store.history_after(None).unwrap();
        assert_eq!(all.len(), 2);
        let rest = store.history_after(Some(all[0].token)).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].token, all[1].token);

        assert_eq!(store.prune_history(all[0].token).unwrap(), 1);
        assert_eq!(store.history_after(None).unwrap().len(), 1);
    }

    #[test]
    fn test_fetch_with_equality_filter() {
        let store = store();
        insert(&store, "Note", attrs! { "title" => "a" });
        let b = insert(&store, "Note", attrs! { "title" => "b" });
        insert(&store, "Folder", attrs! { "title" => "b" });

        let found = store
            .fetch("Note", &AttributeFilter::equals("title", "b"))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b);
    }

    #[test]
    fn test_read_only_rejects_commit() {
        let store = MemoryObjectStore::new(StoreDescriptor::in_memory("Ro").with_read_only(true), 1);
        assert!(matches!(
            store.commit(StoreCommit::new("test")),
            Err(CofferError::ReadOnly(_))
        ));
    }
}
