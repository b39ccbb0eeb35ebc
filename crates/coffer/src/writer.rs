//! The writer: commits collected context changes and publishes them

use crate::context::{ContextId, MergePayload, PendingSave};
use crate::notifier::Notifier;
use crate::stores::StoreSet;
use coffer_core::{
    error::{CofferError, Result},
    observe,
    types::{ChangeKind, ChangeSet, ObjectId, StoreIdentity},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Outcome of a tracked save
#[derive(Debug)]
pub struct SaveReport {
    /// Stores whose part of the save is durable
    pub committed: Vec<StoreIdentity>,
    pub result: Result<ChangeSet>,
}

pub struct Writer {
    stores: Arc<StoreSet>,
    notifier: Notifier,
    author: String,
    system_prefix: String,
}

impl Writer {
    pub fn new(
        stores: Arc<StoreSet>,
        notifier: Notifier,
        author: impl Into<String>,
        system_prefix: impl Into<String>,
    ) -> Self {
        Self {
            stores,
            notifier,
            author: author.into(),
            system_prefix: system_prefix.into(),
        }
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    /// Commit `pending` store by store and publish the resulting change
    /// set. Each store's part is atomic; when a later store fails, parts
    /// already committed to earlier stores stay committed and are still
    /// published before the error is returned.
    ///
    /// Returns the published change set, empty when nothing changed.
    pub fn save(&self, pending: PendingSave, origin: Option<ContextId>) -> Result<ChangeSet> {
        self.save_tracked(pending, origin).result
    }

    /// [`Writer::save`], also reporting which stores committed so the
    /// originating context can promote exactly those changes.
    pub fn save_tracked(&self, pending: PendingSave, origin: Option<ContextId>) -> SaveReport {
        let mut committed = Vec::new();
        let result = self.commit_all(pending, origin, &mut committed);
        SaveReport { committed, result }
    }

    fn commit_all(
        &self,
        pending: PendingSave,
        origin: Option<ContextId>,
        committed: &mut Vec<StoreIdentity>,
    ) -> Result<ChangeSet> {
        if pending.is_empty() {
            return Ok(ChangeSet::new());
        }

        let start = Instant::now();
        let mut change_set = ChangeSet::new();
        let mut snapshots = BTreeMap::new();
        let mut objects = 0;
        let mut failure = None;

        for (identity, mut commit) in pending.commits {
            let Some(store) = self.stores.by_identity(&identity) else {
                failure = Some(CofferError::NotFound(format!("Store {identity}")));
                break;
            };
            commit.author = self.author.clone();

            let inserted: Vec<ObjectId> = commit.inserts.iter().map(|o| o.id.clone()).collect();
            let deleted = commit.deletes.clone();

            let info = match store.commit(commit) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Save to store {} failed: {}", identity, e);
                    failure = Some(e);
                    break;
                }
            };
            objects += info.inserted + info.updated + info.deleted;
            committed.push(identity);

            for id in inserted {
                change_set.record(id, ChangeKind::Insert);
            }
            for id in info.changed {
                change_set.record(id, ChangeKind::Update);
            }
            for id in deleted {
                change_set.record(id, ChangeKind::Delete);
            }
            for object in info.objects {
                snapshots.insert(object.id.clone(), object);
            }
        }

        observe::record_save(start.elapsed(), objects, failure.is_none());
        let change_set = change_set.filter_system(&self.system_prefix);
        if change_set.is_empty() {
            debug!("Save wrote {} objects, nothing to publish", objects);
        } else {
            debug!(
                "Saved {} objects ({} types changed)",
                objects,
                change_set.changed_types.len()
            );
            self.notifier.publish(MergePayload {
                origin,
                change_set: change_set.clone(),
                snapshots,
            })?;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(change_set),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::SubscriptionFilter;
    use crate::pool::ContextPool;
    use crate::stores::tests::{memory_store_set, note_schema};
    use coffer_core::attrs;
    use coffer_core::config::StoreDescriptor;
    use coffer_core::schema::{AttributeKind, AttributeSchema, EntitySchema};
    use coffer_core::traits::{AttributeFilter, ObjectStore};
    use coffer_core::types::{
        CommitInfo, HistoryToken, HistoryTransaction, StoreCommit, StoreMetadata, StoredObject,
    };
    use coffer_core::MemoryObjectStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store whose commits fail while `fail` is set
    struct FlakyStore {
        inner: MemoryObjectStore,
        fail: AtomicBool,
    }

    impl ObjectStore for FlakyStore {
        fn identity(&self) -> StoreIdentity {
            self.inner.identity()
        }

        fn descriptor(&self) -> &StoreDescriptor {
            self.inner.descriptor()
        }

        fn metadata(&self) -> Result<StoreMetadata> {
            self.inner.metadata()
        }

        fn load(&self, id: &ObjectId) -> Result<Option<StoredObject>> {
            self.inner.load(id)
        }

        fn fetch(&self, entity: &str, filter: &AttributeFilter) -> Result<Vec<StoredObject>> {
            self.inner.fetch(entity, filter)
        }

        fn allocate_keys(&self, count: u64) -> Result<u64> {
            self.inner.allocate_keys(count)
        }

        fn commit(&self, commit: StoreCommit) -> Result<CommitInfo> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CofferError::Save("disk full".into()));
            }
            self.inner.commit(commit)
        }

        fn history_after(&self, after: Option<HistoryToken>) -> Result<Vec<HistoryTransaction>> {
            self.inner.history_after(after)
        }

        fn prune_history(&self, up_to: HistoryToken) -> Result<usize> {
            self.inner.prune_history(up_to)
        }
    }

    fn setup() -> (Arc<ContextPool>, Notifier, Writer) {
        let stores = memory_store_set();
        let pool = Arc::new(ContextPool::new(stores.clone()));
        let notifier = Notifier::start(pool.clone(), 16).unwrap();
        let writer = Writer::new(stores, notifier.clone(), "test.writer", "_");
        (pool, notifier, writer)
    }

    #[test]
    fn test_save_classifies_changes() {
        let (pool, notifier, writer) = setup();
        let mut ctx = pool.create_context(false);

        let note = ctx.insert("Note", attrs! { "title" => "a" }).unwrap();
        let pending = ctx.collect_changes().unwrap();
        let inserted = writer.save(pending, Some(ctx.id())).unwrap();
        ctx.mark_saved();
        let id = ctx.identity_of(note).unwrap();
        assert!(inserted.inserted.contains(&id));
        assert!(inserted.changed_types.contains("Note"));

        // Same value again: nothing to report
        ctx.set(note, "title", "a").unwrap();
        let pending = ctx.collect_changes().unwrap();
        assert!(writer.save(pending, Some(ctx.id())).unwrap().is_empty());
        ctx.mark_saved();

        ctx.set(note, "title", "b").unwrap();
        let pending = ctx.collect_changes().unwrap();
        let updated = writer.save(pending, Some(ctx.id())).unwrap();
        ctx.mark_saved();
        assert!(updated.updated.contains(&id));

        ctx.delete(note).unwrap();
        let pending = ctx.collect_changes().unwrap();
        let deleted = writer.save(pending, Some(ctx.id())).unwrap();
        assert!(deleted.deleted.contains(&id));
        assert!(deleted.updated.is_empty());

        notifier.shutdown();
    }

    #[test]
    fn test_empty_save_is_not_published() {
        let (pool, notifier, writer) = setup();
        let mut all = notifier.subscribe(SubscriptionFilter::Types(Default::default()));
        let mut ctx = pool.create_context(false);

        let pending = ctx.collect_changes().unwrap();
        assert!(writer.save(pending, None).unwrap().is_empty());
        notifier.flush().unwrap();
        assert!(all.try_next().is_none());

        notifier.shutdown();
    }

    #[test]
    fn test_partial_save_only_retries_failed_store() {
        let schema = note_schema().with_entity(
            "Log",
            EntitySchema::new()
                .in_configuration("Logs")
                .with_attribute("line", AttributeSchema::required(AttributeKind::Text)),
        );
        let notes: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new(
            StoreDescriptor::in_memory("Default"),
            1,
        ));
        let logs = Arc::new(FlakyStore {
            inner: MemoryObjectStore::new(StoreDescriptor::in_memory("Logs"), 1),
            fail: AtomicBool::new(true),
        });
        let flaky: Arc<dyn ObjectStore> = logs.clone();
        let stores = Arc::new(StoreSet::new(vec![notes.clone(), flaky], Arc::new(schema)).unwrap());
        let pool = Arc::new(ContextPool::new(stores.clone()));
        let notifier = Notifier::start(pool.clone(), 16).unwrap();
        let writer = Writer::new(stores, notifier.clone(), "test.writer", "_");

        let mut ctx = pool.create_context(false);
        ctx.insert("Note", attrs! { "title" => "a" }).unwrap();
        ctx.insert("Log", attrs! { "line" => "b" }).unwrap();

        let failed = writer.save_tracked(ctx.collect_changes().unwrap(), Some(ctx.id()));
        assert!(matches!(failed.result, Err(CofferError::Save(_))));
        assert!(!failed.committed.contains(&logs.identity()));
        ctx.mark_saved_in(&failed.committed);

        logs.fail.store(false, Ordering::SeqCst);
        let retry = writer.save_tracked(ctx.collect_changes().unwrap(), Some(ctx.id()));
        let change_set = retry.result.unwrap();
        assert_eq!(change_set.inserted.len() + failed.committed.len(), 2);
        ctx.mark_saved();
        assert!(!ctx.has_changes());

        assert_eq!(notes.fetch("Note", &AttributeFilter::All).unwrap().len(), 1);
        assert_eq!(logs.fetch("Log", &AttributeFilter::All).unwrap().len(), 1);
        notifier.shutdown();
    }
}
