//! Per-store exclusive locks
//!
//! Each physical store gets one mutex, created on first use. Work that must
//! not run twice at once for the same store (history reconciliation, token
//! updates) holds the store's lock; work for different stores proceeds in
//! parallel.

use crate::types::StoreIdentity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<StoreIdentity, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `store`. Callers hold `lock.lock()` for the duration of
    /// the exclusive section; a second caller for the same store waits.
    pub fn for_store(&self, store: &StoreIdentity) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(store.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the store's lock.
    pub fn with_store<T>(&self, store: &StoreIdentity, f: impl FnOnce() -> T) -> T {
        let lock = self.for_store(store);
        let started = Instant::now();
        let _guard = lock.lock();
        crate::observe::record_lock_wait(started.elapsed());
        f()
    }

    /// True while someone holds the store's lock.
    pub fn is_locked(&self, store: &StoreIdentity) -> bool {
        self.locks
            .lock()
            .get(store)
            .map(|l| l.is_locked())
            .unwrap_or(false)
    }

    pub fn num_stores(&self) -> usize {
        self.locks.lock().len()
    }
}
