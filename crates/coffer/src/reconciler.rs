//! History reconciliation
//!
//! Folds history written to a store by other parties into one change set
//! and publishes it the same way as a local save. The per-store cursor is
//! kept in the [`TokenTable`] and persisted before anything is published,
//! so a crash at worst re-reports a batch and never skips one.

use crate::context::MergePayload;
use crate::notifier::{ExternalChangeNotice, Notifier};
use crate::stores::StoreSet;
use coffer_core::{
    config::ReconcilerConfig,
    error::{CofferError, Result},
    lock_manager::LockManager,
    observe,
    traits::{ObjectStore, TokenTable},
    types::{ChangeSet, HistoryToken, HistoryTransaction, StoreIdentity},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What one reconciliation pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing new in history; only a metadata notice was emitted.
    MetadataOnly,
    /// New transactions were folded and the cursor advanced to `token`.
    /// `change_set` is None when every change was filtered out.
    Folded {
        token: HistoryToken,
        transactions: usize,
        change_set: Option<ChangeSet>,
    },
}

/// Fold transactions into one change set: a delete anywhere wins over
/// inserts and updates of the same object, and an insert followed by
/// updates stays an insert.
pub fn fold_transactions<'a>(
    transactions: impl IntoIterator<Item = &'a HistoryTransaction>,
    config: &ReconcilerConfig,
    system_prefix: &str,
) -> ChangeSet {
    let mut change_set = ChangeSet::new();
    for tx in transactions {
        if config.exclude_authors.contains(&tx.author) {
            continue;
        }
        for change in &tx.changes {
            change_set.record(change.id.clone(), change.kind);
        }
    }
    change_set.filter_system(system_prefix)
}

pub struct HistoryReconciler {
    stores: Arc<StoreSet>,
    tokens: Arc<dyn TokenTable>,
    notifier: Notifier,
    locks: LockManager,
    config: ReconcilerConfig,
    system_prefix: String,
}

impl HistoryReconciler {
    /// `local_author` is the author the edit queue saves under. Its
    /// transactions were already published when they were saved, so they
    /// are excluded unless the config asks for local replay.
    pub fn new(
        stores: Arc<StoreSet>,
        tokens: Arc<dyn TokenTable>,
        notifier: Notifier,
        mut config: ReconcilerConfig,
        local_author: &str,
        system_prefix: impl Into<String>,
    ) -> Self {
        if !config.replay_local_saves {
            config.exclude_authors.insert(local_author.to_string());
        }
        Self {
            stores,
            tokens,
            notifier,
            locks: LockManager::new(),
            config,
            system_prefix: system_prefix.into(),
        }
    }

    pub fn tokens(&self) -> &Arc<dyn TokenTable> {
        &self.tokens
    }

    /// Run one pass over `store`. Passes over the same store are
    /// serialized; passes over different stores may run concurrently.
    pub fn reconcile(&self, store: &StoreIdentity) -> Result<ReconcileOutcome> {
        let target = self
            .stores
            .by_identity(store)
            .ok_or_else(|| CofferError::NotFound(format!("Store {store}")))?
            .clone();
        self.locks.with_store(store, || self.pass(target.as_ref()))
    }

    fn pass(&self, store: &dyn ObjectStore) -> Result<ReconcileOutcome> {
        let identity = store.identity();
        let start = Instant::now();
        let after = self.tokens.load(&identity)?;

        let transactions = store.history_after(after).map_err(|e| {
            warn!("History fetch for {} failed: {}", identity, e);
            match e {
                CofferError::HistoryFetch(_) => e,
                other => CofferError::HistoryFetch(other.to_string()),
            }
        })?;

        let Some(last) = transactions.last().map(|tx| tx.token) else {
            debug!("No new history for {}", identity);
            self.notifier.publish_external(ExternalChangeNotice {
                store: identity,
                at: chrono::Utc::now(),
            })?;
            return Ok(ReconcileOutcome::MetadataOnly);
        };

        let change_set = fold_transactions(&transactions, &self.config, &self.system_prefix);
        self.tokens.store(&identity, last)?;
        observe::record_reconcile(start.elapsed(), transactions.len());

        info!(
            "Reconciled {} transactions from {} (token {} -> {})",
            transactions.len(),
            identity,
            after.map(|t| t.to_string()).unwrap_or_else(|| "none".into()),
            last
        );

        if change_set.is_empty() {
            return Ok(ReconcileOutcome::Folded {
                token: last,
                transactions: transactions.len(),
                change_set: None,
            });
        }

        let mut snapshots = BTreeMap::new();
        for id in change_set.inserted.iter().chain(change_set.updated.iter()) {
            if let Some(object) = store.load(id)? {
                snapshots.insert(id.clone(), object);
            }
        }
        self.notifier.publish(MergePayload {
            origin: None,
            change_set: change_set.clone(),
            snapshots,
        })?;

        Ok(ReconcileOutcome::Folded {
            token: last,
            transactions: transactions.len(),
            change_set: Some(change_set),
        })
    }

    /// Drop history every consumer has passed. Only rows up to the stored
    /// cursor can be pruned.
    pub fn prune(&self, store: &StoreIdentity, up_to: HistoryToken) -> Result<usize> {
        let target = self
            .stores
            .by_identity(store)
            .ok_or_else(|| CofferError::NotFound(format!("Store {store}")))?
            .clone();
        self.locks.with_store(store, || {
            match self.tokens.load(store)? {
                Some(cursor) if cursor >= up_to => {}
                cursor => {
                    return Err(CofferError::InvalidState(format!(
                        "Cannot prune {} up to {}: cursor is at {}",
                        store,
                        up_to,
                        cursor.map(|t| t.to_string()).unwrap_or_else(|| "none".into())
                    )))
                }
            }
            target.prune_history(up_to)
        })
    }
}
