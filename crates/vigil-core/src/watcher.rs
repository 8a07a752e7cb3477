//! Watcher: one periodic background task with its own lifecycle signals.
//!
//! The poll loop is deliberately simple: set `started`, then wait on the
//! stop signal with the wait period as timeout — a timeout means "tick",
//! a set signal means "wind down". Cancellation is therefore cooperative
//! with at most one wait period of latency, and an in-progress tick is
//! never interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::WatcherConfig;
use crate::error::{Result, WatcherError};
use crate::event::SignalSet;
use crate::types::{ExecutionMode, WatcherId, WatcherState};

/// Collaborator logic invoked by a watcher's poll loop.
///
/// A failed tick is logged and the loop keeps polling; it does not mark
/// the watcher done and does not affect `is_alive`. Implementations that
/// want a failure to end the run must observe it themselves and ask the
/// registry to stop the watcher.
pub trait Poller: Send + Sync + 'static {
    /// One polling tick. Return value is logged, never propagated.
    fn tick(&self) -> Result<()>;

    /// Invoked once after the loop exits, before the done signal is set.
    fn post_run(&self) -> Result<()> {
        Ok(())
    }
}

/// One registered periodic background task.
///
/// Shared via `Arc`: the registry, the spawned loop, and (after a fork)
/// the worker process all hold the same instance. All mutability is
/// internal and lock-guarded.
pub struct Watcher {
    id: WatcherId,
    name: String,
    wait_period: Duration,
    owner_pid: u32,
    poller: Arc<dyn Poller>,
    /// Replaced wholesale on a substrate switch, never mutated in kind.
    signals: Mutex<SignalSet>,
    /// True once `start()` has been called; the actual spawn may be
    /// deferred to `start_all`.
    armed: AtomicBool,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Watcher {
    /// Creates a watcher from a validated configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: WatcherConfig, poller: impl Poller) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            id: WatcherId::new(),
            name: config.name,
            wait_period: config.wait_period,
            owner_pid: std::process::id(),
            poller: Arc::new(poller),
            signals: Mutex::new(SignalSet::thread()),
            armed: AtomicBool::new(false),
            handle: Mutex::new(None),
        }))
    }

    /// Returns the watcher's stable identity.
    #[must_use]
    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Returns the watcher's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the duration between polling ticks.
    #[must_use]
    pub const fn wait_period(&self) -> Duration {
        self.wait_period
    }

    /// Returns the pid of the process that created this watcher.
    ///
    /// Diagnostic only: after a fork the same watcher object exists in
    /// two processes, and this tells them apart from the loop's actual
    /// `std::process::id()`.
    #[must_use]
    pub const fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Returns the execution substrate this watcher is bound to.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.signals.lock().mode()
    }

    /// Returns a snapshot of the watcher's signal set.
    #[must_use]
    pub fn signals(&self) -> SignalSet {
        self.signals.lock().clone()
    }

    /// Derives the lifecycle state from the signals.
    #[must_use]
    pub fn state(&self) -> WatcherState {
        let signals = self.signals.lock();
        if signals.done().is_set() {
            WatcherState::Done
        } else if signals.stop().is_set() {
            WatcherState::Stopping
        } else if signals.started().is_set() {
            WatcherState::Running
        } else if self.armed.load(Ordering::Acquire) {
            WatcherState::Starting
        } else {
            WatcherState::Registered
        }
    }

    /// Returns true if `start()` has been called for the current run.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Arms the watcher for a run: clears stop/done for a fresh cycle.
    ///
    /// When no loop thread is alive, `started` is cleared too, so the
    /// derived state walks through `Starting` again instead of reporting
    /// a stale `Running` from the previous run.
    pub(crate) fn arm(&self) {
        let signals = self.signals.lock();
        signals.rearm();
        if !self.thread_alive() {
            signals.started().clear();
        }
        self.armed.store(true, Ordering::Release);
    }

    /// Disarms after a thread-mode stop released the execution unit.
    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Switches the watcher to subprocess-mode signals.
    ///
    /// Must happen before the fork, and only while the watcher has never
    /// actually run: the substrate is immutable once started.
    ///
    /// # Errors
    /// Returns an error if the watcher is already running or has run, or
    /// if the process-shareable signals cannot be created.
    #[cfg(unix)]
    pub(crate) fn switch_to_subprocess(&self) -> Result<()> {
        let mut signals = self.signals.lock();
        if self.thread_alive() || signals.started().is_set() {
            return Err(WatcherError::state(format!(
                "watcher {} already started; substrate is immutable",
                self.name
            )));
        }
        if signals.mode() == ExecutionMode::Subprocess {
            return Ok(());
        }
        *signals = SignalSet::subprocess()?;
        tracing::debug!(watcher = %self.id, name = %self.name, "switched to subprocess signals");
        Ok(())
    }

    /// Reverts an unstarted watcher to thread-mode signals.
    ///
    /// Undo path for a fleet launch that switched some watchers before
    /// failing: a started watcher keeps its current set.
    #[cfg(unix)]
    pub(crate) fn reset_to_thread(&self) {
        let mut signals = self.signals.lock();
        if !self.thread_alive() && !signals.started().is_set() {
            *signals = SignalSet::thread();
        }
    }

    /// Spawns the poll loop as a thread in the current process.
    ///
    /// No-op if the loop is already running.
    ///
    /// # Errors
    /// Returns an error if the OS refuses a new thread.
    pub(crate) fn spawn(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        let this = Arc::clone(self);
        let joiner = std::thread::Builder::new()
            .name(format!("vigil-{}", self.name))
            .spawn(move || this.run())
            .map_err(|e| WatcherError::spawn(format!("watcher thread: {e}")))?;
        *handle = Some(joiner);
        tracing::debug!(watcher = %self.id, name = %self.name, pid = std::process::id(), "spawned watcher loop");
        Ok(())
    }

    /// The poll loop. Runs inside whichever execution unit hosts it.
    fn run(self: Arc<Self>) {
        // Snapshot: the set bound at spawn time drives the whole run,
        // immune to any later (illegal) swap attempts.
        let signals = self.signals();
        let stop = signals.stop();

        signals.started().set();
        loop {
            if stop.wait(Some(self.wait_period)) {
                break;
            }
            if let Err(err) = self.poller.tick() {
                tracing::warn!(watcher = %self.id, name = %self.name, error = %err, "tick failed; continuing");
            }
        }
        if let Err(err) = self.poller.post_run() {
            tracing::warn!(watcher = %self.id, name = %self.name, error = %err, "post-run hook failed");
        }
        signals.done().set();
        tracing::debug!(watcher = %self.id, name = %self.name, "watcher loop done");
    }

    /// Returns true if the loop thread exists in this process and has
    /// not finished.
    #[must_use]
    pub fn thread_alive(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Releases ownership of the loop thread, if any.
    pub(crate) fn take_handle(&self) -> Option<std::thread::JoinHandle<()>> {
        self.handle.lock().take()
    }

    /// Blocks on the done signal up to `timeout`.
    ///
    /// Returns regardless of whether it was set; callers re-check state.
    pub fn wait_done(&self, timeout: Option<Duration>) {
        let _ = self.signals().done().wait(timeout);
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("wait_period", &self.wait_period)
            .field("owner_pid", &self.owner_pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
