//! Deadline guard for mount teardown.
//!
//! Teardown waits on things the mount does not control: a backend call can hang forever. The
//! watchdog is armed when teardown starts and disarmed when it finishes. If the deadline passes
//! first, the [`ExpiryAction`] runs; by default it terminates the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

/// How long teardown may take before the watchdog fires.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(15);

/// Exit status used when the watchdog terminates the process (`EX_SOFTWARE`).
pub const EXIT_CODE: i32 = 70;

/// What happens when the deadline passes.
pub trait ExpiryAction: Send + Sync + 'static {
    /// Called at most once, on the watchdog thread, after `deadline` has elapsed.
    fn expire(&self, deadline: Duration);
}

/// Terminates the process without waiting for anything else.
#[derive(Debug, Clone, Copy)]
pub struct TerminateProcess {
    /// Process exit status.
    pub exit_code: i32,
}

impl Default for TerminateProcess {
    fn default() -> Self {
        Self {
            exit_code: EXIT_CODE,
        }
    }
}

impl ExpiryAction for TerminateProcess {
    fn expire(&self, deadline: Duration) {
        error!(
            ?deadline,
            exit_code = self.exit_code,
            "teardown did not complete in time, terminating"
        );
        std::process::exit(self.exit_code);
    }
}

/// Lifecycle of a [`ShutdownWatchdog`]. `Armed` moves to exactly one of the other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WatchdogState {
    /// Counting down.
    Armed = 0,
    /// Teardown finished in time.
    Disarmed = 1,
    /// The deadline passed and the action ran.
    Expired = 2,
}

impl WatchdogState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Armed,
            1 => Self::Disarmed,
            _ => Self::Expired,
        }
    }
}

/// An armed deadline running on its own thread.
///
/// Dropping an armed watchdog does not disarm it: the thread keeps counting and still fires.
/// Only [`disarm`](Self::disarm) stops it.
#[derive(Debug)]
#[must_use = "dropping the watchdog leaves it armed"]
pub struct ShutdownWatchdog {
    state: Arc<AtomicU8>,
    disarm_tx: Sender<()>,
    thread: JoinHandle<()>,
    deadline: Duration,
}

impl ShutdownWatchdog {
    /// Start counting down from `deadline`.
    pub fn arm(deadline: Duration, action: Arc<dyn ExpiryAction>) -> std::io::Result<Self> {
        let state = Arc::new(AtomicU8::new(WatchdogState::Armed as u8));
        let (disarm_tx, disarm_rx) = crossbeam_channel::bounded::<()>(1);
        let armed_at = Instant::now();

        let thread = {
            let state = Arc::clone(&state);
            std::thread::Builder::new()
                .name("docfs-watchdog".to_owned())
                .spawn(move || {
                    match disarm_rx.recv_timeout(deadline) {
                        Ok(()) => return,
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            std::thread::sleep(deadline.saturating_sub(armed_at.elapsed()));
                        }
                    }
                    let fired = state
                        .compare_exchange(
                            WatchdogState::Armed as u8,
                            WatchdogState::Expired as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok();
                    if fired {
                        action.expire(deadline);
                    }
                })?
        };

        debug!(?deadline, "shutdown watchdog armed");
        Ok(Self {
            state,
            disarm_tx,
            thread,
            deadline,
        })
    }

    /// Stop the countdown.
    ///
    /// Returns [`WatchdogState::Expired`] if the deadline won the race, in which case the action
    /// has already run (or is running).
    pub fn disarm(self) -> WatchdogState {
        let Self {
            state,
            disarm_tx,
            thread,
            deadline,
        } = self;

        let disarmed = state
            .compare_exchange(
                WatchdogState::Armed as u8,
                WatchdogState::Disarmed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !disarmed {
            warn!(?deadline, "watchdog fired before it could be disarmed");
            return WatchdogState::Expired;
        }

        // The thread is either waiting on the channel or about to lose the state race.
        let _ = disarm_tx.try_send(());
        if thread.join().is_err() {
            error!("watchdog thread panicked");
        }
        debug!("shutdown watchdog disarmed");
        WatchdogState::Disarmed
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WatchdogState {
        WatchdogState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The deadline this watchdog was armed with.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}
