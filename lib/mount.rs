//! The per-mount context.
//!
//! A [`MountContext`] owns every piece of state one mount needs: the handle table and its
//! allocator, the work dispatcher, the admission gate, the stats sink and the watchdog action used
//! at teardown. It is shared by reference (`Arc`) with whatever drives the kernel callbacks; every
//! kernel-facing operation is a plain `&self` method that can run on any thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::admission::AdmissionGate;
use crate::backend::{BackendError, ChildEntry, ObjectAttrs, Permissions, StorageBackend};
use crate::dispatch::{BackendCall, DispatcherOptions, Fetch, List, Stat, WorkDispatcher};
use crate::error::FsError;
use crate::handle::{FileHandle, HandleAllocator, HandleTable};
use crate::path::ObjectPath;
use crate::telemetry::{StatOp, StatRecord, StatsSink};
use crate::watchdog::{self, ExpiryAction, ShutdownWatchdog, TerminateProcess, WatchdogState};

/// Block size reported by [`MountContext::statfs`].
pub const BLOCK_SIZE: u32 = 4096;

/// Longest entry name reported by [`MountContext::statfs`].
pub const MAX_NAME_LENGTH: u32 = 255;

/// Knobs for [`MountContext::init`].
#[derive(Debug)]
pub struct MountOptions {
    /// Worker pool and queue sizing.
    pub dispatcher: DispatcherOptions,
    /// How long an operation waits for its backend call. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// How long teardown may take before the watchdog fires.
    pub watchdog_deadline: Duration,
    /// Where per-operation stats go.
    pub stats: StatsSink,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherOptions::default(),
            request_timeout: None,
            watchdog_deadline: watchdog::DEFAULT_DEADLINE,
            stats: StatsSink::disabled(),
        }
    }
}

/// Lifecycle of a mount. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MountState {
    /// Being constructed.
    Initializing = 0,
    /// Serving requests.
    Active = 1,
    /// Refusing new work while in-flight work drains.
    Quiescing = 2,
    /// Everything released.
    TornDown = 3,
}

impl MountState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Initializing,
            1 => Self::Active,
            2 => Self::Quiescing,
            _ => Self::TornDown,
        }
    }
}

bitflags! {
    /// Access mode requested by `access(2)`, using the `R_OK`/`W_OK`/`X_OK` bit values.
    ///
    /// The empty set is an existence check (`F_OK`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMode: i32 {
        /// Read permission.
        const READ = libc::R_OK;
        /// Write permission.
        const WRITE = libc::W_OK;
        /// Execute or search permission.
        const EXECUTE = libc::X_OK;
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The requested access would succeed.
    Allowed,
    /// The object exists but the requested access is not permitted.
    Denied,
}

/// Filesystem statistics returned by [`MountContext::statfs`].
///
/// Block-related sizes are in units of `block_size` bytes. The store's capacity is not known to
/// the mount, so block counts are zero and nothing is ever free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Number of currently open files.
    pub open_files: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}

/// A mount could not be brought up.
#[derive(Debug, Error)]
pub enum MountError {
    /// The backend refused the connection.
    #[error("failed to connect to the store")]
    Connect(#[source] BackendError),

    /// The dispatcher worker threads could not be started.
    #[error("failed to start dispatcher workers")]
    SpawnWorkers(#[source] std::io::Error),
}

/// Teardown was requested again.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Teardown already started (or finished) on another call.
    #[error("mount is already shut down")]
    AlreadyShutDown,
}

/// What teardown did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Operations in flight when quiescing began.
    pub in_flight_at_start: usize,
    /// Backend calls still queued when quiescing began.
    pub queued_at_start: usize,
    /// Handles that were still open and got released by teardown.
    pub released_handles: usize,
    /// Stats records dropped over the mount's lifetime.
    pub stats_dropped: u64,
    /// Final watchdog state, or `None` if the watchdog thread could not be started.
    pub watchdog: Option<WatchdogState>,
    /// Wall time teardown took.
    pub elapsed: Duration,
}

/// All state belonging to one mount of a [`StorageBackend`].
pub struct MountContext<B: StorageBackend> {
    backend: Arc<B>,
    handles: HandleTable,
    allocator: HandleAllocator,
    dispatcher: WorkDispatcher<B>,
    gate: AdmissionGate,
    stats: StatsSink,
    expiry: Arc<dyn ExpiryAction>,
    state: AtomicU8,
    request_timeout: Option<Duration>,
    watchdog_deadline: Duration,
}

impl<B: StorageBackend> MountContext<B> {
    /// Connect to the store and bring the mount up.
    ///
    /// A watchdog that fires during teardown terminates the process.
    pub fn init(endpoint: &B::Endpoint, options: MountOptions) -> Result<Arc<Self>, MountError> {
        Self::init_with_expiry(endpoint, options, Arc::new(TerminateProcess::default()))
    }

    /// Like [`init`](Self::init), with a custom action for an expired teardown watchdog.
    pub fn init_with_expiry(
        endpoint: &B::Endpoint,
        options: MountOptions,
        expiry: Arc<dyn ExpiryAction>,
    ) -> Result<Arc<Self>, MountError> {
        let backend = B::connect(endpoint).map_err(MountError::Connect)?;
        Self::with_backend(Arc::new(backend), options, expiry)
    }

    /// Bring a mount up over an already-connected backend.
    pub fn with_backend(
        backend: Arc<B>,
        options: MountOptions,
        expiry: Arc<dyn ExpiryAction>,
    ) -> Result<Arc<Self>, MountError> {
        let MountOptions {
            dispatcher,
            request_timeout,
            watchdog_deadline,
            stats,
        } = options;

        let dispatcher = WorkDispatcher::spawn(Arc::clone(&backend), dispatcher)
            .map_err(MountError::SpawnWorkers)?;

        let ctx = Self {
            backend,
            handles: HandleTable::new(),
            allocator: HandleAllocator::new(),
            dispatcher,
            gate: AdmissionGate::new(),
            stats,
            expiry,
            state: AtomicU8::new(MountState::Initializing as u8),
            request_timeout,
            watchdog_deadline,
        };
        ctx.state.store(MountState::Active as u8, Ordering::SeqCst);
        info!(
            workers = ctx.dispatcher.worker_count(),
            ?request_timeout,
            ?watchdog_deadline,
            "mount active"
        );
        Ok(Arc::new(ctx))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MountState {
        MountState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether new work is being refused.
    #[must_use]
    pub fn is_quiescing(&self) -> bool {
        self.gate.is_quiescing()
    }

    /// The open-handle table.
    #[must_use]
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// The dispatcher running backend calls for this mount.
    #[must_use]
    pub fn dispatcher(&self) -> &WorkDispatcher<B> {
        &self.dispatcher
    }

    /// The connected backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Gated operations currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    fn run<C: BackendCall>(&self, call: C) -> Result<C::Output, FsError> {
        let completion = self.dispatcher.submit(call)?;
        let output = match self.request_timeout {
            Some(timeout) => completion.wait_timeout(timeout),
            None => completion.wait(),
        }?;
        Ok(output)
    }

    /// Open the file at `path`, returning a handle that is never reused by this mount.
    #[instrument(name = "MountContext::open", skip(self), fields(path = %path))]
    pub fn open(&self, path: &ObjectPath) -> Result<FileHandle, FsError> {
        let _admitted = self.gate.admit()?;

        let attrs = self.run(Stat { path: path.clone() })?;
        if attrs.is_dir() {
            return Err(FsError::IsADirectory(path.clone()));
        }
        let fh = self
            .handles
            .allocate_and_insert(&self.allocator, path.clone(), attrs)?;

        self.stats.record(StatRecord::new(StatOp::Open, path, 0, 0));
        debug!(fh, "opened");
        Ok(fh)
    }

    /// Read up to `len` bytes at `offset` from an open handle.
    ///
    /// The handle's entry stays alive for the whole read, even if it is released concurrently.
    #[instrument(name = "MountContext::read", skip(self))]
    pub fn read(&self, fh: FileHandle, offset: u64, len: u32) -> Result<Bytes, FsError> {
        let _admitted = self.gate.admit()?;

        let entry = self
            .handles
            .lookup_by_handle(fh)
            .ok_or(FsError::UnknownHandle(fh))?;
        let data = self.run(Fetch {
            path: entry.path.clone(),
            offset,
            len,
        })?;

        self.stats.record(StatRecord::new(
            StatOp::Read,
            &entry.path,
            offset,
            data.len() as u64,
        ));
        entry.release();
        Ok(data)
    }

    /// Attributes of the object at `path`.
    #[instrument(name = "MountContext::stat", skip(self), fields(path = %path))]
    pub fn stat(&self, path: &ObjectPath) -> Result<ObjectAttrs, FsError> {
        let _admitted = self.gate.admit()?;

        let attrs = self.run(Stat { path: path.clone() })?;
        self.stats
            .record(StatRecord::new(StatOp::Stat, path, 0, attrs.size));
        Ok(attrs)
    }

    /// Children of the directory at `path`, ordered by name.
    #[instrument(name = "MountContext::list", skip(self), fields(path = %path))]
    pub fn list(&self, path: &ObjectPath) -> Result<Vec<ChildEntry>, FsError> {
        let _admitted = self.gate.admit()?;

        let children = self.run(List { path: path.clone() })?;
        self.stats.record(StatRecord::new(
            StatOp::List,
            path,
            0,
            children.len() as u64,
        ));
        Ok(children)
    }

    /// Check whether `mode` access to `path` would be permitted.
    ///
    /// The mount is read-only, so write access is always denied. Read and execute are checked
    /// against the object's permission bits for any class of user.
    #[instrument(name = "MountContext::access", skip(self), fields(path = %path))]
    pub fn access(&self, path: &ObjectPath, mode: AccessMode) -> Result<Access, FsError> {
        let _admitted = self.gate.admit()?;

        let attrs = self.run(Stat { path: path.clone() })?;
        let denied = mode.contains(AccessMode::WRITE)
            || (mode.contains(AccessMode::READ) && !attrs.perm.intersects(Permissions::ALL_READ))
            || (mode.contains(AccessMode::EXECUTE)
                && !attrs.perm.intersects(Permissions::ALL_EXECUTE));

        self.stats
            .record(StatRecord::new(StatOp::Access, path, 0, 0));
        Ok(if denied { Access::Denied } else { Access::Allowed })
    }

    /// Filesystem-wide statistics.
    #[instrument(name = "MountContext::statfs", skip(self))]
    pub fn statfs(&self) -> Result<FsStats, FsError> {
        let _admitted = self.gate.admit()?;

        let stats = FsStats {
            block_size: BLOCK_SIZE,
            total_blocks: 0,
            free_blocks: 0,
            available_blocks: 0,
            open_files: self.handles.len() as u64,
            max_filename_length: MAX_NAME_LENGTH,
        };
        self.stats
            .record(StatRecord::new(StatOp::Statfs, &ObjectPath::root(), 0, 0));
        Ok(stats)
    }

    /// Close a handle.
    ///
    /// Not gated by quiescing: closing handles during teardown only helps it along. Reads already
    /// holding the entry finish normally.
    #[instrument(name = "MountContext::release", skip(self))]
    pub fn release(&self, fh: FileHandle) -> Result<(), FsError> {
        let entry = self.handles.remove(fh).ok_or(FsError::UnknownHandle(fh))?;
        self.stats
            .record(StatRecord::new(StatOp::Release, &entry.path, 0, 0));
        let freed = entry.release();
        debug!(freed, "released");
        Ok(())
    }

    /// Tear the mount down. Only the first call does anything.
    ///
    /// New work is refused from the moment this is called. The watchdog is armed before waiting on
    /// anything; if teardown outlives its deadline, the expiry action runs (by default the process
    /// exits).
    pub fn shutdown(&self) -> Result<ShutdownReport, ShutdownError> {
        if !self.gate.begin_quiesce() {
            return Err(ShutdownError::AlreadyShutDown);
        }
        let started = Instant::now();
        self.state.store(MountState::Quiescing as u8, Ordering::SeqCst);

        let in_flight_at_start = self.gate.in_flight();
        let queued_at_start = self.dispatcher.queued();
        info!(
            in_flight = in_flight_at_start,
            queued = queued_at_start,
            open_handles = self.handles.len(),
            "quiescing mount"
        );

        let watchdog =
            match ShutdownWatchdog::arm(self.watchdog_deadline, Arc::clone(&self.expiry)) {
                Ok(watchdog) => Some(watchdog),
                Err(e) => {
                    error!(error = %e, "failed to start shutdown watchdog, tearing down without it");
                    None
                }
            };

        self.dispatcher.close();
        self.gate.wait_drained();
        self.dispatcher.join();
        let released_handles = self.handles.drain();
        if released_handles > 0 {
            warn!(released_handles, "handles still open at teardown");
        }
        self.stats.close();

        let watchdog = watchdog.map(ShutdownWatchdog::disarm);
        self.state.store(MountState::TornDown as u8, Ordering::SeqCst);

        let report = ShutdownReport {
            in_flight_at_start,
            queued_at_start,
            released_handles,
            stats_dropped: self.stats.dropped(),
            watchdog,
            elapsed: started.elapsed(),
        };
        info!(?report, "mount torn down");
        Ok(report)
    }
}

impl<B: StorageBackend> Drop for MountContext<B> {
    fn drop(&mut self) {
        if self.state() == MountState::Active
            && let Err(e) = self.shutdown()
        {
            debug!(error = %e, "teardown on drop skipped");
        }
    }
}

impl<B: StorageBackend> std::fmt::Debug for MountContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountContext")
            .field("state", &self.state())
            .field("open_handles", &self.handles.len())
            .field("in_flight", &self.gate.in_flight())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
