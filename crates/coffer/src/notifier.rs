//! Change notification
//!
//! Every non-empty save and every folded reconciliation batch is handed to
//! a dedicated notifier thread, which merges it into auto-merging contexts
//! and then fans the change set out to subscribers. Delivery never runs on
//! the writer thread and never on a caller's thread.

use crate::context::MergePayload;
use crate::pool::ContextPool;
use coffer_core::{
    error::{CofferError, Result},
    types::{ChangeSet, ObjectId, StoreIdentity},
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc as tokio_mpsc};
use tracing::{debug, trace, warn};

/// History changed but produced nothing that can be reported per object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalChangeNotice {
    pub store: StoreIdentity,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// What a subscriber wants to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// Change sets touching any of these entities; empty means all
    Types(BTreeSet<String>),
    /// Updates and deletes of one object
    Object(ObjectId),
}

impl SubscriptionFilter {
    fn matches(&self, change_set: &ChangeSet) -> bool {
        match self {
            SubscriptionFilter::Types(types) => change_set.touches_any(types),
            SubscriptionFilter::Object(id) => {
                change_set.updated.contains(id) || change_set.deleted.contains(id)
            }
        }
    }
}

/// Receiving end of a subscription. Holds at most the notifier capacity of
/// undelivered change sets; a stream that falls further behind is cut off
/// and ends once its buffer is drained.
pub struct ChangeStream {
    rx: tokio_mpsc::Receiver<ChangeSet>,
}

impl ChangeStream {
    /// Next change set, None once the coordinator shuts down
    pub async fn next(&mut self) -> Option<ChangeSet> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<ChangeSet> {
        self.rx.try_recv().ok()
    }

    /// Blocking variant for synchronous callers. Must not be called from
    /// inside an async runtime.
    pub fn blocking_next(&mut self) -> Option<ChangeSet> {
        self.rx.blocking_recv()
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    tx: tokio_mpsc::Sender<ChangeSet>,
}

enum Event {
    Changes(Arc<MergePayload>),
    External(ExternalChangeNotice),
    Flush(mpsc::Sender<()>),
}

/// Handle to the notifier thread. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    tx: Arc<Mutex<Option<mpsc::Sender<Event>>>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    external: broadcast::Sender<ExternalChangeNotice>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
    capacity: usize,
}

impl Notifier {
    pub fn start(pool: Arc<ContextPool>, capacity: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Event>();
        let subscribers: Arc<Mutex<Vec<Subscriber>>> = Arc::new(Mutex::new(Vec::new()));
        let capacity = capacity.max(1);
        let (external, _) = broadcast::channel(capacity);

        let thread = {
            let subscribers = subscribers.clone();
            let external = external.clone();
            std::thread::Builder::new()
                .name("coffer-notifier".into())
                .spawn(move || run(rx, pool, subscribers, external))?
        };

        Ok(Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            subscribers,
            external,
            thread: Arc::new(Mutex::new(Some(thread))),
            capacity,
        })
    }

    /// Queue a change for merging and delivery.
    pub fn publish(&self, payload: MergePayload) -> Result<()> {
        self.send(Event::Changes(Arc::new(payload)))
    }

    pub fn publish_external(&self, notice: ExternalChangeNotice) -> Result<()> {
        self.send(Event::External(notice))
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> ChangeStream {
        let (tx, rx) = tokio_mpsc::channel(self.capacity);
        self.subscribers.lock().push(Subscriber { filter, tx });
        ChangeStream { rx }
    }

    pub fn external_notices(&self) -> broadcast::Receiver<ExternalChangeNotice> {
        self.external.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Block until everything published so far has been delivered.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.send(Event::Flush(tx))?;
        rx.recv().map_err(|_| CofferError::Closed)
    }

    /// Deliver what is queued, then stop the thread. Open streams end.
    /// From the notifier thread itself the thread is left to exit on its
    /// own once the queue is empty.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() == std::thread::current().id() {
                debug!("Notifier shutdown requested from the notifier thread; detaching");
            } else if thread.join().is_err() {
                warn!("Notifier thread panicked");
            }
        }
        self.subscribers.lock().clear();
    }

    fn send(&self, event: Event) -> Result<()> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(event).map_err(|_| CofferError::Closed),
            None => Err(CofferError::Closed),
        }
    }
}

fn run(
    rx: mpsc::Receiver<Event>,
    pool: Arc<ContextPool>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    external: broadcast::Sender<ExternalChangeNotice>,
) {
    debug!("Notifier started");
    while let Ok(event) = rx.recv() {
        match event {
            Event::Changes(payload) => {
                let merged = pool.deliver(&payload);
                let mut subscribers = subscribers.lock();
                subscribers.retain(|s| !s.tx.is_closed());
                let mut notified = 0;
                subscribers.retain(|subscriber| {
                    if !subscriber.filter.matches(&payload.change_set) {
                        return true;
                    }
                    match subscriber.tx.try_send(payload.change_set.clone()) {
                        Ok(()) => {
                            notified += 1;
                            true
                        }
                        Err(TrySendError::Full(_)) => {
                            warn!(
                                "Dropping subscriber ({:?}) that fell {} change sets behind",
                                subscriber.filter,
                                subscriber.tx.max_capacity()
                            );
                            false
                        }
                        Err(TrySendError::Closed(_)) => false,
                    }
                });
                trace!(
                    "Delivered change of {} objects to {} contexts and {} subscribers",
                    payload.change_set.len(),
                    merged,
                    notified
                );
            }
            Event::External(notice) => {
                // No receivers is fine.
                let _ = external.send(notice);
            }
            Event::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Notifier stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::tests::memory_store_set;
    use coffer_core::types::ChangeKind;
    use std::collections::BTreeMap;

    fn note_change(key: u64, kind: ChangeKind) -> MergePayload {
        let mut change_set = ChangeSet::new();
        change_set.record(
            ObjectId::new(StoreIdentity::new("s"), "Note", key),
            kind,
        );
        MergePayload {
            origin: None,
            change_set,
            snapshots: BTreeMap::new(),
        }
    }

    #[test]
    fn test_type_filter() {
        let notifier = Notifier::start(Arc::new(ContextPool::new(memory_store_set())), 8).unwrap();
        let mut notes = notifier.subscribe(SubscriptionFilter::Types(BTreeSet::from([
            "Note".to_string(),
        ])));
        let mut tags = notifier.subscribe(SubscriptionFilter::Types(BTreeSet::from([
            "Tag".to_string(),
        ])));
        let mut all = notifier.subscribe(SubscriptionFilter::Types(BTreeSet::new()));

        notifier.publish(note_change(1, ChangeKind::Insert)).unwrap();
        notifier.flush().unwrap();

        assert!(notes.try_next().is_some());
        assert!(tags.try_next().is_none());
        assert!(all.try_next().is_some());
        notifier.shutdown();
    }

    #[test]
    fn test_object_filter_ignores_inserts() {
        let notifier = Notifier::start(Arc::new(ContextPool::new(memory_store_set())), 8).unwrap();
        let id = ObjectId::new(StoreIdentity::new("s"), "Note", 1);
        let mut stream = notifier.subscribe(SubscriptionFilter::Object(id));

        notifier.publish(note_change(1, ChangeKind::Insert)).unwrap();
        notifier.publish(note_change(1, ChangeKind::Update)).unwrap();
        notifier.flush().unwrap();

        let change = stream.try_next().unwrap();
        assert_eq!(change.updated.len(), 1);
        assert!(stream.try_next().is_none());
        notifier.shutdown();
    }

    #[test]
    fn test_dropped_streams_are_pruned() {
        let notifier = Notifier::start(Arc::new(ContextPool::new(memory_store_set())), 8).unwrap();
        let stream = notifier.subscribe(SubscriptionFilter::Types(BTreeSet::new()));
        drop(stream);
        notifier.publish(note_change(1, ChangeKind::Insert)).unwrap();
        notifier.flush().unwrap();
        assert_eq!(notifier.subscriber_count(), 0);
        notifier.shutdown();
    }

    #[test]
    fn test_lagging_subscriber_is_dropped() {
        let notifier = Notifier::start(Arc::new(ContextPool::new(memory_store_set())), 2).unwrap();
        let mut slow = notifier.subscribe(SubscriptionFilter::Types(BTreeSet::new()));
        for key in 1..=3 {
            notifier.publish(note_change(key, ChangeKind::Insert)).unwrap();
        }
        notifier.flush().unwrap();
        assert_eq!(notifier.subscriber_count(), 0);

        // Buffered change sets are still readable, then the stream ends.
        assert!(slow.try_next().is_some());
        assert!(slow.try_next().is_some());
        assert!(slow.try_next().is_none());
        assert!(slow.blocking_next().is_none());

        // Later subscribers are unaffected.
        let mut fresh = notifier.subscribe(SubscriptionFilter::Types(BTreeSet::new()));
        notifier.publish(note_change(4, ChangeKind::Insert)).unwrap();
        notifier.flush().unwrap();
        assert!(fresh.try_next().is_some());
        notifier.shutdown();
    }

    #[test]
    fn test_publish_after_shutdown_is_closed() {
        let notifier = Notifier::start(Arc::new(ContextPool::new(memory_store_set())), 8).unwrap();
        notifier.shutdown();
        assert!(matches!(
            notifier.publish(note_change(1, ChangeKind::Insert)),
            Err(CofferError::Closed)
        ));
    }
}
