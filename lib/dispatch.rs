//! Off-thread execution of backend calls.
//!
//! Kernel callbacks never talk to the backend themselves. They package the call as a
//! [`BackendCall`], [`submit`](WorkDispatcher::submit) it to a fixed pool of worker threads, and
//! wait on the returned [`Completion`], optionally with a deadline.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::backend::{BackendError, ChildEntry, ObjectAttrs, StorageBackend};
use crate::path::ObjectPath;

/// Why a dispatched call produced no backend result.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher no longer accepts work.
    #[error("dispatcher is shutting down")]
    ShuttingDown,

    /// The queue is full and the fail-fast policy is active.
    #[error("dispatcher queue is full")]
    Busy,

    /// The caller stopped waiting before the call completed.
    #[error("timed out waiting for the backend")]
    TimedOut,

    /// The worker running the call died before completing it.
    #[error("worker exited before completing the call")]
    WorkerLost,

    /// The call ran and the backend reported a failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// What a submitter does when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backpressure {
    /// Block the submitting thread until a slot frees up.
    #[default]
    Block,
    /// Refuse the submission with [`DispatchError::Busy`].
    FailFast,
}

/// Sizing of a [`WorkDispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherOptions {
    /// Number of worker threads. Zero is treated as one.
    pub workers: usize,
    /// Capacity of the queue between submitters and workers.
    pub queue_depth: usize,
    /// Behaviour when the queue is full.
    pub backpressure: Backpressure,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
            backpressure: Backpressure::Block,
        }
    }
}

/// A backend operation that can run on a dispatcher worker.
pub trait BackendCall: Send + 'static {
    /// What the call produces on success.
    type Output: Send + 'static;

    /// Short operation name used in logs.
    const NAME: &'static str;

    /// Run the call against `backend`.
    fn call<B: StorageBackend>(self, backend: &B) -> Result<Self::Output, BackendError>;
}

/// Read a byte range of an object.
#[derive(Debug, Clone)]
pub struct Fetch {
    /// Object to read.
    pub path: ObjectPath,
    /// Start of the range.
    pub offset: u64,
    /// Maximum number of bytes.
    pub len: u32,
}

impl BackendCall for Fetch {
    type Output = Bytes;
    const NAME: &'static str = "fetch";

    fn call<B: StorageBackend>(self, backend: &B) -> Result<Bytes, BackendError> {
        backend.fetch(&self.path, self.offset, self.len)
    }
}

/// Look up the attributes of an object.
#[derive(Debug, Clone)]
pub struct Stat {
    /// Object to look up.
    pub path: ObjectPath,
}

impl BackendCall for Stat {
    type Output = ObjectAttrs;
    const NAME: &'static str = "stat";

    fn call<B: StorageBackend>(self, backend: &B) -> Result<ObjectAttrs, BackendError> {
        backend.stat(&self.path)
    }
}

/// List a directory.
#[derive(Debug, Clone)]
pub struct List {
    /// Directory to list.
    pub path: ObjectPath,
}

impl BackendCall for List {
    type Output = Vec<ChildEntry>;
    const NAME: &'static str = "list";

    fn call<B: StorageBackend>(self, backend: &B) -> Result<Vec<ChildEntry>, BackendError> {
        backend.list(&self.path)
    }
}

/// One unit of queued work: a call already bound to its completion slot.
struct WorkItem<B> {
    op: &'static str,
    run: Box<dyn FnOnce(&B) + Send>,
}

/// The receiving end of a submitted call.
///
/// Each completion is fulfilled at most once. If the worker running the call dies first, waiting
/// reports [`DispatchError::WorkerLost`].
#[derive(Debug)]
#[must_use = "a completion does nothing unless waited on"]
pub struct Completion<T> {
    slot: Receiver<Result<T, BackendError>>,
}

impl<T> Completion<T> {
    /// Block until the call completes.
    pub fn wait(self) -> Result<T, DispatchError> {
        match self.slot.recv() {
            Ok(outcome) => outcome.map_err(DispatchError::from),
            Err(_) => Err(DispatchError::WorkerLost),
        }
    }

    /// Block for at most `timeout`.
    ///
    /// On [`DispatchError::TimedOut`] the call keeps running on its worker; its result is
    /// discarded.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, DispatchError> {
        match self.slot.recv_timeout(timeout) {
            Ok(outcome) => outcome.map_err(DispatchError::from),
            Err(RecvTimeoutError::Timeout) => Err(DispatchError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::WorkerLost),
        }
    }

    /// Take the result if it is ready.
    ///
    /// Once this has returned `Some`, the completion is spent and further polls report
    /// [`DispatchError::WorkerLost`].
    pub fn try_wait(&mut self) -> Option<Result<T, DispatchError>> {
        match self.slot.try_recv() {
            Ok(outcome) => Some(outcome.map_err(DispatchError::from)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(DispatchError::WorkerLost)),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    executing: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// A bounded queue feeding a fixed pool of worker threads.
///
/// Items are not ordered relative to each other. The number of backend calls running at once never
/// exceeds the worker count.
pub struct WorkDispatcher<B> {
    sender: RwLock<Option<Sender<WorkItem<B>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    backpressure: Backpressure,
    backlog: Receiver<WorkItem<B>>,
    counters: Arc<Counters>,
}

impl<B: StorageBackend> WorkDispatcher<B> {
    /// Start the worker threads.
    pub fn spawn(backend: Arc<B>, options: DispatcherOptions) -> std::io::Result<Self> {
        let worker_count = options.workers.max(1);
        let (sender, receiver) = crossbeam_channel::bounded::<WorkItem<B>>(options.queue_depth);
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let backend = Arc::clone(&backend);
            let queue = receiver.clone();
            let counters = Arc::clone(&counters);
            // On failure the already-spawned workers see the queue disconnect and exit.
            let worker = std::thread::Builder::new()
                .name(format!("docfs-worker-{id}"))
                .spawn(move || worker_loop(id, &*backend, &queue, &counters))?;
            workers.push(worker);
        }

        debug!(
            workers = worker_count,
            queue_depth = options.queue_depth,
            backpressure = ?options.backpressure,
            "dispatcher started"
        );

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            worker_count,
            backpressure: options.backpressure,
            backlog: receiver,
            counters,
        })
    }

    /// Queue `call` for execution.
    ///
    /// Under [`Backpressure::Block`] this blocks while the queue is full.
    pub fn submit<C: BackendCall>(&self, call: C) -> Result<Completion<C::Output>, DispatchError> {
        // Clone out so a blocked send does not hold the lock against `close`.
        let Some(sender) = self.sender.read().clone() else {
            return Err(DispatchError::ShuttingDown);
        };

        let (slot_tx, slot_rx) = crossbeam_channel::bounded(1);
        let item = WorkItem {
            op: C::NAME,
            run: Box::new(move |backend: &B| {
                if slot_tx.send(call.call(backend)).is_err() {
                    trace!(op = C::NAME, "caller stopped waiting, result discarded");
                }
            }),
        };

        let sent = match self.backpressure {
            Backpressure::Block => sender.send(item).map_err(|_| DispatchError::ShuttingDown),
            Backpressure::FailFast => sender.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => DispatchError::Busy,
                TrySendError::Disconnected(_) => DispatchError::ShuttingDown,
            }),
        };
        if let Err(e) = sent {
            trace!(op = C::NAME, error = %e, "submission refused");
            return Err(e);
        }

        Ok(Completion { slot: slot_rx })
    }

    /// Stop accepting submissions. Already-queued items still run.
    ///
    /// Returns `false` if the dispatcher was already closed.
    pub fn close(&self) -> bool {
        let was_open = self.sender.write().take().is_some();
        if was_open {
            debug!(queued = self.queued(), "dispatcher closed to new work");
        }
        was_open
    }

    /// Close the dispatcher and wait for every worker to finish the remaining queue and exit.
    pub fn join(&self) {
        self.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let name = worker.thread().name().unwrap_or("<unnamed>").to_owned();
            if worker.join().is_err() {
                error!(worker = name, "dispatcher worker terminated abnormally");
            }
        }
    }

    /// Whether submissions are still accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Items waiting in the queue for a worker. Submitters blocked on a full queue are not
    /// counted.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.backlog.len()
    }

    /// Items currently running on a worker.
    #[must_use]
    pub fn executing(&self) -> usize {
        self.counters.executing.load(Ordering::SeqCst)
    }

    /// Items that ran to completion (successfully or not) since the dispatcher started.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    /// Items whose worker panicked while running them.
    #[must_use]
    pub fn panicked(&self) -> u64 {
        self.counters.panicked.load(Ordering::Relaxed)
    }
}

impl<B> Drop for WorkDispatcher<B> {
    fn drop(&mut self) {
        // Workers drain what is left and exit on their own once the sender is gone.
        self.sender.get_mut().take();
    }
}

impl<B> std::fmt::Debug for WorkDispatcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkDispatcher")
            .field("workers", &self.worker_count)
            .field("backpressure", &self.backpressure)
            .field("accepting", &self.sender.read().is_some())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

fn worker_loop<B>(id: usize, backend: &B, queue: &Receiver<WorkItem<B>>, counters: &Counters) {
    for item in queue {
        counters.executing.fetch_add(1, Ordering::SeqCst);

        let WorkItem { op, run } = item;
        // A panicking call drops its completion slot during unwinding; the waiter sees
        // `WorkerLost` and this worker keeps serving.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(backend)));

        counters.executing.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(worker = id, op, "backend call panicked");
            }
        }
    }
    debug!(worker = id, "dispatcher worker exiting");
}
