//! Serial edit queue
//!
//! All mutations run one at a time on a single dedicated writer thread, in
//! submission order. A failing or panicking job is reported to its caller
//! and the queue moves on to the next job.

use coffer_core::error::{CofferError, Result};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct EditQueue {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EditQueue {
    pub fn start() -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let thread = std::thread::Builder::new()
            .name("coffer-writer".into())
            .spawn(move || {
                debug!("Writer thread started");
                while let Ok(job) = rx.recv() {
                    job();
                }
                debug!("Writer thread stopped");
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue `job` and get a receiver for its result.
    pub fn submit<T, F>(&self, job: F) -> Result<oneshot::Receiver<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(Box::new(move || {
            let result = run_guarded(job);
            // The caller may have stopped waiting.
            let _ = result_tx.send(result);
        }))?;
        Ok(result_rx)
    }

    /// Queue `job` and block the calling thread until it has run. Usable
    /// from inside an async runtime as well as from plain threads.
    pub fn run_blocking<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        self.send(Box::new(move || {
            let _ = result_tx.send(run_guarded(job));
        }))?;
        result_rx.recv().map_err(|_| CofferError::Closed)?
    }

    /// Queue `job` without waiting for it. Failures are logged.
    pub fn submit_detached<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.send(Box::new(move || {
            if let Err(e) = run_guarded(job) {
                warn!("Detached edit failed: {}", e);
            }
        }))
    }

    /// Stop accepting jobs, run what is already queued, then join the
    /// writer thread.
    ///
    /// Called from a job on the writer thread itself, it only stops
    /// intake: the thread finishes the current job and whatever is still
    /// queued, then exits on its own.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            debug!("Writer shutdown requested from the writer thread; detaching");
            return;
        }
        if thread.join().is_err() {
            error!("Writer thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    fn send(&self, job: Job) -> Result<()> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(job).map_err(|_| CofferError::Closed),
            None => Err(CofferError::Closed),
        }
    }
}

fn run_guarded<T>(job: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Edit panicked: {}", message);
            Err(CofferError::Operation(format!("edit panicked: {message}")))
        }
    }
}
