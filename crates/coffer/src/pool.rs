//! Context pool
//!
//! Hands out scoped contexts and tracks the ones that asked to receive
//! every save automatically. Registrations are weak; a dropped context
//! simply stops receiving.

use crate::context::{Context, ContextId, MergeInbox, MergePayload};
use crate::stores::StoreSet;
use coffer_core::observe;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

pub struct ContextPool {
    stores: Arc<StoreSet>,
    next_id: AtomicU64,
    inboxes: Mutex<Vec<(ContextId, Weak<MergeInbox>)>>,
}

impl ContextPool {
    pub fn new(stores: Arc<StoreSet>) -> Self {
        Self {
            stores,
            next_id: AtomicU64::new(1),
            inboxes: Mutex::new(Vec::new()),
        }
    }

    /// New context on the calling thread. With `merge` set the context
    /// receives every save made elsewhere before its next operation.
    pub fn create_context(&self, merge: bool) -> Context {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inbox = merge.then(|| {
            let inbox = Arc::new(MergeInbox::default());
            let mut inboxes = self.inboxes.lock();
            inboxes.push((id, Arc::downgrade(&inbox)));
            observe::set_live_contexts(inboxes.len());
            inbox
        });
        trace!("Created context {} (merge: {})", id, merge);
        Context::new(id, self.stores.clone(), inbox)
    }

    /// Queue `payload` for every live merging context except its origin.
    /// Returns how many contexts received it.
    pub fn deliver(&self, payload: &Arc<MergePayload>) -> usize {
        let mut inboxes = self.inboxes.lock();
        let mut delivered = 0;
        inboxes.retain(|(id, inbox)| {
            let Some(inbox) = inbox.upgrade() else {
                return false;
            };
            if payload.origin != Some(*id) {
                inbox.push(payload.clone());
                delivered += 1;
            }
            true
        });
        observe::set_live_contexts(inboxes.len());
        delivered
    }

    /// Merging contexts still alive
    pub fn live_contexts(&self) -> usize {
        self.inboxes
            .lock()
            .iter()
            .filter(|(_, inbox)| inbox.strong_count() > 0)
            .count()
    }

    pub fn stores(&self) -> &Arc<StoreSet> {
        &self.stores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::tests::memory_store_set;
    use coffer_core::types::ChangeSet;
    use std::collections::BTreeMap;

    fn payload(origin: Option<ContextId>) -> Arc<MergePayload> {
        Arc::new(MergePayload {
            origin,
            change_set: ChangeSet::new(),
            snapshots: BTreeMap::new(),
        })
    }

    #[test]
    fn test_delivery_skips_origin_and_plain_contexts() {
        let pool = ContextPool::new(memory_store_set());
        let a = pool.create_context(true);
        let _b = pool.create_context(true);
        let _plain = pool.create_context(false);

        assert_eq!(pool.deliver(&payload(Some(a.id()))), 1);
        assert_eq!(pool.deliver(&payload(None)), 2);
    }

    #[test]
    fn test_dropped_contexts_are_pruned() {
        let pool = ContextPool::new(memory_store_set());
        let a = pool.create_context(true);
        assert_eq!(pool.live_contexts(), 1);
        drop(a);
        assert_eq!(pool.live_contexts(), 0);
        assert_eq!(pool.deliver(&payload(None)), 0);
    }

    #[test]
    fn test_context_ids_are_unique() {
        let pool = ContextPool::new(memory_store_set());
        let a = pool.create_context(false);
        let b = pool.create_context(false);
        assert_ne!(a.id(), b.id());
    }
}
