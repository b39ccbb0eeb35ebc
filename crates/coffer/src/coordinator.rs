//! Coordinator facade
//!
//! Single entry point bundling the open stores, the context pool, the
//! serial edit queue, the notifier and the history reconciler.

use crate::context::{Context, Handle};
use crate::edit_queue::EditQueue;
use crate::migration::MigrationManager;
use crate::notifier::{ChangeStream, ExternalChangeNotice, Notifier, SubscriptionFilter};
use crate::pool::ContextPool;
use crate::reconciler::{HistoryReconciler, ReconcileOutcome};
use crate::remote::RemoteWriter;
use crate::stores::{self, StoreSet};
use crate::token_table::{FileTokenTable, MemoryTokenTable};
use crate::writer::{SaveReport, Writer};
use coffer_core::{
    config::CoordinatorConfig,
    error::{CofferError, Result},
    schema::SchemaCatalog,
    traits::{ObjectStore, TokenTable},
    types::{ChangeSet, HistoryToken, ObjectId, StoreIdentity, StoreMetadata},
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Embedded object coordinator
///
/// Cheap to clone; every clone talks to the same stores and threads. The
/// last clone to drop shuts everything down.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoordinatorConfig,
    catalog: Arc<SchemaCatalog>,
    stores: Arc<StoreSet>,
    pool: Arc<ContextPool>,
    notifier: Notifier,
    writer: Arc<Writer>,
    queue: EditQueue,
    reconciler: Arc<HistoryReconciler>,
    closed: AtomicBool,
}

impl Coordinator {
    /// Open every configured store, migrating on-disk stores to the
    /// catalog's latest version.
    ///
    /// Creates missing store files and parent directories. A store marked
    /// `delete_on_open_failure` that fails to open is erased and opened
    /// once more; any other failure aborts.
    pub fn open(config: CoordinatorConfig, catalog: SchemaCatalog) -> Result<Self> {
        let tokens: Arc<dyn TokenTable> = match &config.token_table_path {
            Some(path) => Arc::new(FileTokenTable::open(path)?),
            None => Arc::new(MemoryTokenTable::new()),
        };
        Self::open_with_tokens(config, catalog, tokens)
    }

    /// Open with a caller-supplied token table
    pub fn open_with_tokens(
        config: CoordinatorConfig,
        catalog: SchemaCatalog,
        tokens: Arc<dyn TokenTable>,
    ) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(catalog);
        let schema = Arc::new(catalog.latest()?.clone());
        let migrations = MigrationManager::new(catalog.clone());

        let mut opened: Vec<Arc<dyn ObjectStore>> = Vec::with_capacity(config.stores.len());
        for descriptor in &config.stores {
            let store = stores::open_with_recovery(descriptor, |d| {
                stores::open_store(d, &catalog, &migrations, config.read_pool_size)
            })?;
            opened.push(store);
        }

        let stores = Arc::new(StoreSet::new(opened, schema)?);
        let pool = Arc::new(ContextPool::new(stores.clone()));
        let notifier = Notifier::start(pool.clone(), config.notifier_capacity)?;
        let writer = Arc::new(Writer::new(
            stores.clone(),
            notifier.clone(),
            config.writer_author.clone(),
            config.system_type_prefix.clone(),
        ));
        let reconciler = Arc::new(HistoryReconciler::new(
            stores.clone(),
            tokens,
            notifier.clone(),
            config.reconciler.clone(),
            &config.writer_author,
            config.system_type_prefix.clone(),
        ));
        let queue = EditQueue::start()?;

        info!(
            "Coordinator open: {} stores at schema v{}",
            stores.len(),
            stores.schema().version
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                stores,
                pool,
                notifier,
                writer,
                queue,
                reconciler,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn edit_job<T, F>(&self, op: F) -> impl FnOnce() -> Result<T> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut Context) -> Result<T> + Send + 'static,
    {
        let pool = self.inner.pool.clone();
        let writer = self.inner.writer.clone();
        move || {
            let mut ctx = pool.create_context(false);
            let value = op(&mut ctx)?;
            let pending = ctx.collect_changes()?;
            writer.save(pending, Some(ctx.id()))?;
            Ok(value)
        }
    }

    /// Run `op` on the writer thread in a fresh context and save what it
    /// changed. Resolves once the changes are durable (or failed).
    pub async fn edit<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Context) -> Result<T> + Send + 'static,
    {
        let rx = self.inner.queue.submit(self.edit_job(op))?;
        rx.await.map_err(|_| CofferError::Closed)?
    }

    /// Blocking [`Coordinator::edit`]. Must not be called from inside an
    /// edit.
    pub fn edit_sync<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Context) -> Result<T> + Send + 'static,
    {
        self.inner.queue.run_blocking(self.edit_job(op))
    }

    /// Queue an edit without waiting for it. Failures are only logged.
    pub fn edit_detached<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&mut Context) -> Result<()> + Send + 'static,
    {
        self.inner.queue.submit_detached(self.edit_job(op))
    }

    /// Edit the object `id`; fails with `NotFound` if it does not resolve.
    pub async fn edit_with<T, F>(&self, id: ObjectId, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Context, Handle) -> Result<T> + Send + 'static,
    {
        self.edit(move |ctx| {
            let handle = resolve_required(ctx, &id)?;
            op(ctx, handle)
        })
        .await
    }

    pub async fn edit_with2<T, F>(&self, a: ObjectId, b: ObjectId, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Context, Handle, Handle) -> Result<T> + Send + 'static,
    {
        self.edit(move |ctx| {
            let ha = resolve_required(ctx, &a)?;
            let hb = resolve_required(ctx, &b)?;
            op(ctx, ha, hb)
        })
        .await
    }

    /// Read in a fresh context on a blocking worker. Nothing is saved.
    pub async fn fetch<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Context) -> Result<T> + Send + 'static,
    {
        let pool = self.inner.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut ctx = pool.create_context(false);
            op(&mut ctx)
        })
        .await
        .map_err(|e| CofferError::Operation(format!("fetch task failed: {e}")))?
    }

    /// Read in a fresh context on the calling thread.
    pub fn fetch_sync<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        let mut ctx = self.inner.pool.create_context(false);
        op(&mut ctx)
    }

    pub async fn fetch_with<T, F>(&self, id: ObjectId, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Context, Handle) -> Result<T> + Send + 'static,
    {
        self.fetch(move |ctx| {
            let handle = resolve_required(ctx, &id)?;
            op(ctx, handle)
        })
        .await
    }

    pub async fn fetch_with2<T, F>(&self, a: ObjectId, b: ObjectId, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Context, Handle, Handle) -> Result<T> + Send + 'static,
    {
        self.fetch(move |ctx| {
            let ha = resolve_required(ctx, &a)?;
            let hb = resolve_required(ctx, &b)?;
            op(ctx, ha, hb)
        })
        .await
    }

    /// Long-lived context on the calling thread. With `merge` set it picks
    /// up every save made elsewhere before its next operation.
    pub fn create_context(&self, merge: bool) -> Context {
        self.inner.pool.create_context(merge)
    }

    /// Save a caller-owned context through the writer. The context itself
    /// is excluded from the merge of its own save.
    ///
    /// When a save spanning several stores fails part way, the changes of
    /// the stores that did commit are promoted and a retry only writes
    /// what is still pending.
    pub fn save(&self, ctx: &mut Context) -> Result<ChangeSet> {
        let pending = ctx.collect_changes()?;
        if pending.is_empty() {
            ctx.mark_saved();
            return Ok(ChangeSet::new());
        }
        let writer = self.inner.writer.clone();
        let origin = ctx.id();
        let report = self
            .inner
            .queue
            .run_blocking(move || Ok(writer.save_tracked(pending, Some(origin))))?;
        settle(ctx, report)
    }

    /// Non-blocking [`Coordinator::save`]
    pub async fn save_async(&self, ctx: &mut Context) -> Result<ChangeSet> {
        let pending = ctx.collect_changes()?;
        if pending.is_empty() {
            ctx.mark_saved();
            return Ok(ChangeSet::new());
        }
        let writer = self.inner.writer.clone();
        let origin = ctx.id();
        let rx = self
            .inner
            .queue
            .submit(move || Ok(writer.save_tracked(pending, Some(origin))))?;
        let report = rx.await.map_err(|_| CofferError::Closed)??;
        settle(ctx, report)
    }

    /// Change sets touching any of `types`; no types means every change.
    pub fn subscribe<I, S>(&self, types: I) -> ChangeStream
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: BTreeSet<String> = types.into_iter().map(Into::into).collect();
        self.inner
            .notifier
            .subscribe(SubscriptionFilter::Types(types))
    }

    /// Change sets that update or delete `id`
    pub fn subscribe_object(&self, id: ObjectId) -> ChangeStream {
        self.inner.notifier.subscribe(SubscriptionFilter::Object(id))
    }

    /// Metadata-only notices from reconciliation passes that found no new
    /// history
    pub fn external_notices(&self) -> broadcast::Receiver<ExternalChangeNotice> {
        self.inner.notifier.external_notices()
    }

    /// React to a remote-change signal for `store`: fold its new history and
    /// publish the result.
    pub async fn remote_change(&self, store: StoreIdentity) -> Result<ReconcileOutcome> {
        let reconciler = self.inner.reconciler.clone();
        tokio::task::spawn_blocking(move || reconciler.reconcile(&store))
            .await
            .map_err(|e| CofferError::Operation(format!("reconcile task failed: {e}")))?
    }

    /// Reconcile `store` on the calling thread.
    pub fn reconcile_now(&self, store: &StoreIdentity) -> Result<ReconcileOutcome> {
        self.inner.reconciler.reconcile(store)
    }

    /// Reconcile every store, stopping at the first failure.
    pub fn reconcile_all(&self) -> Result<Vec<ReconcileOutcome>> {
        self.inner
            .stores
            .identities()
            .iter()
            .map(|store| self.inner.reconciler.reconcile(store))
            .collect()
    }

    /// Drop history of `store` up to `up_to`, which must not be beyond the
    /// reconciler's cursor.
    pub fn prune_history(&self, store: &StoreIdentity, up_to: HistoryToken) -> Result<usize> {
        self.inner.reconciler.prune(store, up_to)
    }

    /// Last history token consumed for `store`
    pub fn history_token(&self, store: &StoreIdentity) -> Result<Option<HistoryToken>> {
        self.inner.reconciler.tokens().load(store)
    }

    /// Writer that commits to `store` directly under `author`, as another
    /// process would.
    pub fn remote_writer(
        &self,
        store: &StoreIdentity,
        author: impl Into<String>,
    ) -> Result<RemoteWriter> {
        let target = self
            .inner
            .stores
            .by_identity(store)
            .ok_or_else(|| CofferError::NotFound(format!("Store {store}")))?;
        Ok(RemoteWriter::new(
            target.clone(),
            author,
            self.inner.stores.schema().version,
        ))
    }

    pub fn store_identities(&self) -> Vec<StoreIdentity> {
        self.inner.stores.identities()
    }

    /// Store opened for configuration `name`
    pub fn store(&self, name: &str) -> Option<Arc<dyn ObjectStore>> {
        self.inner.stores.by_configuration(name).cloned()
    }

    pub fn metadata(&self, store: &StoreIdentity) -> Result<StoreMetadata> {
        self.inner
            .stores
            .by_identity(store)
            .ok_or_else(|| CofferError::NotFound(format!("Store {store}")))?
            .metadata()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.inner.catalog
    }

    pub fn schema_version(&self) -> u32 {
        self.inner.stores.schema().version
    }

    /// Merging contexts still alive
    pub fn live_contexts(&self) -> usize {
        self.inner.pool.live_contexts()
    }

    /// Block until every queued edit has run and every resulting change
    /// has been delivered.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.queue.submit_detached(move || {
            let _ = tx.send(());
            Ok(())
        })?;
        rx.recv().map_err(|_| CofferError::Closed)?;
        self.inner.notifier.flush()
    }

    /// Finish queued edits and deliveries, then close every store. Later
    /// edits fail with `Closed`.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.shutdown();
        self.notifier.shutdown();
        for store in self.stores.iter() {
            if let Err(e) = store.close() {
                warn!("Failed to close store {}: {}", store.identity(), e);
            }
        }
        info!("Coordinator shut down");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn settle(ctx: &mut Context, report: SaveReport) -> Result<ChangeSet> {
    match report.result {
        Ok(change_set) => {
            ctx.mark_saved();
            Ok(change_set)
        }
        Err(e) => {
            ctx.mark_saved_in(&report.committed);
            Err(e)
        }
    }
}

fn resolve_required(ctx: &mut Context, id: &ObjectId) -> Result<Handle> {
    ctx.resolve(id)?
        .ok_or_else(|| CofferError::NotFound(id.to_string()))
}
