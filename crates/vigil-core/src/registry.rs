//! The watcher fleet: registration, launch, substrate switch, shutdown.
//!
//! One registry manages exactly one local fleet belonging to one host
//! process. `start_all` runs the fleet either as one thread per watcher
//! in-process, or forks a single shared worker process that re-hosts
//! every registered watcher as a thread. At most one worker is ever
//! forked per registry; later subprocess launches are no-ops.
//!
//! The registry is an explicit object, not process-global state: a fork
//! boundary hands the child its own inherited copy (including the
//! instance snapshot taken at fork time), and the two copies never
//! reconcile.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::RegistryConfig;
use crate::error::Result;
use crate::types::ExecutionMode;
use crate::watcher::Watcher;

#[cfg(unix)]
use crate::error::WatcherError;
#[cfg(unix)]
use crate::event::PipeEvent;
#[cfg(unix)]
use crate::lock::LockRegistry;
#[cfg(unix)]
use vigil_platform::ProcessLivenessProbe;

/// Host-provided hook run in the freshly forked worker to detach any
/// shutdown/cleanup callbacks inherited from the parent's owning task.
/// Failure is logged and ignored; this path never aborts startup.
pub type DetachHook = Box<
    dyn Fn() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
>;

// =============================================================================
// SubprocessHandle
// =============================================================================

/// Ownership of the single shared worker process.
#[cfg(unix)]
pub struct SubprocessHandle {
    pid: u32,
    parent_pid: u32,
    started: PipeEvent,
}

#[cfg(unix)]
impl SubprocessHandle {
    /// Worker process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Pid of the process that forked the worker.
    #[must_use]
    pub const fn parent_pid(&self) -> u32 {
        self.parent_pid
    }

    /// Returns true once the worker's bootstrap has completed.
    #[must_use]
    pub fn started(&self) -> bool {
        self.started.is_set()
    }

    fn probe(&self) -> ProcessLivenessProbe {
        ProcessLivenessProbe::new(self.pid, self.parent_pid)
    }
}

#[cfg(unix)]
impl std::fmt::Debug for SubprocessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessHandle")
            .field("pid", &self.pid)
            .field("parent_pid", &self.parent_pid)
            .field("started", &self.started())
            .finish()
    }
}

// =============================================================================
// WatcherRegistry
// =============================================================================

/// Registry and lifecycle coordinator for one fleet of watchers.
pub struct WatcherRegistry {
    /// Insertion order is registration order; a watcher appears once.
    instances: Mutex<Vec<Arc<Watcher>>>,
    #[cfg(unix)]
    subprocess: Mutex<Option<SubprocessHandle>>,
    detach_hook: Option<DetachHook>,
    config: RegistryConfig,
}

impl WatcherRegistry {
    /// Creates an empty registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(RegistryConfig::default())
    }

    /// Creates an empty registry from a configuration.
    #[must_use]
    pub fn from_config(config: RegistryConfig) -> Self {
        Self {
            instances: Mutex::new(Vec::new()),
            #[cfg(unix)]
            subprocess: Mutex::new(None),
            detach_hook: None,
            config,
        }
    }

    /// Sets the detach hook run inside the forked worker's bootstrap.
    #[must_use]
    pub fn with_detach_hook(mut self, hook: DetachHook) -> Self {
        self.detach_hook = Some(hook);
        self
    }

    /// Registers a watcher. Registering the same watcher twice is a
    /// no-op; order of first registration is preserved.
    pub fn register(&self, watcher: &Arc<Watcher>) {
        let mut instances = self.instances.lock();
        if instances.iter().any(|w| w.id() == watcher.id()) {
            return;
        }
        instances.push(Arc::clone(watcher));
        tracing::debug!(
            watcher = %watcher.id(),
            name = %watcher.name(),
            pid = std::process::id(),
            "registered watcher"
        );
    }

    /// Returns the number of registered watchers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.instances.lock().len()
    }

    /// Returns the registered watchers in registration order.
    #[must_use]
    pub fn registered(&self) -> Vec<Arc<Watcher>> {
        self.instances.lock().clone()
    }

    /// Marks a watcher as started: rearms its signals for a fresh run and
    /// (re-)registers it. The actual spawn happens in `start_all`.
    pub fn start(&self, watcher: &Arc<Watcher>) {
        watcher.arm();
        self.register(watcher);
    }

    /// Launches the fleet per the registry's configuration.
    ///
    /// # Errors
    /// Propagates `start_all` failures.
    pub fn launch(&self) -> Result<()> {
        self.start_all(
            self.config.execute_in_subprocess,
            self.config.wait_for_subprocess,
        )
    }

    /// Launches every started watcher.
    ///
    /// Thread mode spawns one loop thread per armed watcher in this
    /// process. Subprocess mode forks the single shared worker (once per
    /// registry; later calls are no-ops), switching every registered
    /// watcher to process-shareable signals before the fork. With
    /// `wait_for_subprocess` the caller blocks until the worker's
    /// bootstrap signals readiness.
    ///
    /// # Errors
    /// Returns an error if a spawn or the fork fails, if a watcher that
    /// already ran is asked to switch substrate, or if subprocess mode is
    /// requested on a platform without fork.
    pub fn start_all(&self, execute_in_subprocess: bool, wait_for_subprocess: bool) -> Result<()> {
        if !execute_in_subprocess {
            let snapshot = self.registered();
            let mut spawned = 0usize;
            for watcher in &snapshot {
                if watcher.is_armed() && !watcher.thread_alive() {
                    watcher.spawn()?;
                    spawned += 1;
                }
            }
            tracing::info!(spawned, "started watcher fleet in thread mode");
            return Ok(());
        }
        self.start_all_subprocess(wait_for_subprocess)
    }

    #[cfg(unix)]
    #[allow(unsafe_code)] // fork and _exit have no safe wrappers
    fn start_all_subprocess(&self, wait_for_subprocess: bool) -> Result<()> {
        use nix::unistd::{ForkResult, fork};

        let mut subprocess = self.subprocess.lock();
        if subprocess.is_some() {
            tracing::debug!("shared worker already launched; ignoring");
            return Ok(());
        }

        let parent_pid = std::process::id();
        let started = PipeEvent::new()?;
        let snapshot = self.registered();
        // Signals must become process-shareable before the fork so the
        // child inherits the right primitive kind. A refusal (a watcher
        // that already ran in thread mode) aborts the launch; watchers
        // switched before the refusal revert, leaving the whole fleet
        // operable in thread mode.
        for (idx, watcher) in snapshot.iter().enumerate() {
            if let Err(err) = watcher.switch_to_subprocess() {
                for switched in &snapshot[..idx] {
                    switched.reset_to_thread();
                }
                return Err(err);
            }
        }

        // SAFETY: fork is called with the registry lock held only by this
        // thread; the child touches nothing but the snapshot and its own
        // rearmed primitives, and leaves via _exit without unwinding.
        match unsafe { fork() }.map_err(|e| WatcherError::fork(e.to_string()))? {
            ForkResult::Parent { child } => {
                let pid = child.as_raw() as u32;
                *subprocess = Some(SubprocessHandle {
                    pid,
                    parent_pid,
                    started: started.clone(),
                });
                drop(subprocess);
                tracing::info!(pid, watchers = snapshot.len(), "forked shared worker");
                if wait_for_subprocess {
                    let _ = started.wait(None);
                }
                Ok(())
            }
            ForkResult::Child => {
                self.subprocess_main(&snapshot, &started);
                // Skip inherited atexit/cleanup handlers; the parent owns
                // those.
                unsafe { libc::_exit(0) }
            }
        }
    }

    #[cfg(not(unix))]
    fn start_all_subprocess(&self, _wait_for_subprocess: bool) -> Result<()> {
        Err(crate::error::WatcherError::unsupported(
            "subprocess mode requires fork",
        ))
    }

    /// Worker bootstrap: runs once inside the forked child, before any
    /// watcher tick.
    #[cfg(unix)]
    fn subprocess_main(&self, snapshot: &[Arc<Watcher>], started: &PipeEvent) {
        tracing::debug!(pid = std::process::id(), "worker bootstrap");

        // Detach inherited cleanup hooks; failure tolerated silently.
        if let Some(hook) = &self.detach_hook {
            if let Err(err) = hook() {
                tracing::warn!(error = %err, "detach hook failed; continuing");
            }
        }

        // If the parent is being traced, give the tooling a moment to
        // attach here too. Indeterminate means no pause.
        let parent = nix::unistd::getppid().as_raw() as u32;
        if let Ok(tracer) = vigil_platform::proc::tracer_pid(parent) {
            if tracer != 0 {
                tracing::debug!(tracer, "parent is traced; pausing for attach");
                std::thread::sleep(self.config.debugger_attach_delay);
            }
        }

        // Locks copied from the parent may be frozen mid-hold by threads
        // that do not exist here.
        LockRegistry::global().rearm_all();

        for watcher in snapshot {
            if !watcher.is_armed() {
                continue;
            }
            if let Err(err) = watcher.spawn() {
                tracing::error!(watcher = %watcher.id(), error = %err, "failed to spawn in worker");
            }
        }
        started.set();

        // Join in registration order. An abnormal end (the process is
        // being torn down) abandons the remainder instead of hanging.
        for watcher in snapshot {
            let Some(handle) = watcher.take_handle() else {
                continue;
            };
            if handle.join().is_err() {
                tracing::warn!(
                    watcher = %watcher.id(),
                    "watcher thread ended abnormally; abandoning remaining joins"
                );
                break;
            }
        }
        tracing::debug!(pid = std::process::id(), "worker done");
    }

    /// Requests a stop. A never-started watcher is a no-op.
    ///
    /// Sets the stop signal if the execution unit is still alive. For a
    /// thread-mode watcher this also removes it from the registry and
    /// releases the thread handle without joining; subprocess membership
    /// is fixed at fork time.
    pub fn stop(&self, watcher: &Arc<Watcher>) {
        if !watcher.is_armed() {
            return;
        }
        let alive = match watcher.mode() {
            ExecutionMode::Thread => watcher.thread_alive(),
            ExecutionMode::Subprocess => self.is_subprocess_alive(),
        };
        if alive {
            watcher.signals().stop().set();
        }
        if watcher.mode() == ExecutionMode::Thread {
            self.instances.lock().retain(|w| w.id() != watcher.id());
            drop(watcher.take_handle());
            watcher.disarm();
            tracing::debug!(watcher = %watcher.id(), name = %watcher.name(), "released thread-mode watcher");
        }
    }

    /// Blocks on the watcher's done signal up to `timeout` (`None` waits
    /// indefinitely). Returns regardless of the signal's final state.
    pub fn wait(&self, watcher: &Arc<Watcher>, timeout: Option<Duration>) {
        watcher.wait_done(timeout);
    }

    /// Returns true if the watcher's loop is currently hosted by a live
    /// execution unit.
    #[must_use]
    pub fn is_alive(&self, watcher: &Arc<Watcher>) -> bool {
        match watcher.mode() {
            ExecutionMode::Thread => watcher.thread_alive(),
            ExecutionMode::Subprocess => {
                let signals = watcher.signals();
                self.is_subprocess_alive() && signals.started().is_set() && !signals.done().is_set()
            }
        }
    }

    /// Returns true if a shared worker was ever forked for this registry.
    #[must_use]
    pub fn is_subprocess(&self) -> bool {
        #[cfg(unix)]
        {
            self.subprocess.lock().is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Probes the shared worker's liveness.
    ///
    /// False if no worker was ever forked, if it exited or zombied, or if
    /// its fate cannot be determined.
    #[must_use]
    pub fn is_subprocess_alive(&self) -> bool {
        #[cfg(unix)]
        {
            self.subprocess
                .lock()
                .as_ref()
                .is_some_and(|handle| handle.probe().probe().is_alive())
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Pid of the shared worker, if one was forked.
    #[must_use]
    pub fn subprocess_pid(&self) -> Option<u32> {
        #[cfg(unix)]
        {
            self.subprocess.lock().as_ref().map(|h| h.pid())
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    /// Returns true once the worker's bootstrap has signaled readiness.
    #[must_use]
    pub fn subprocess_started(&self) -> bool {
        #[cfg(unix)]
        {
            self.subprocess.lock().as_ref().is_some_and(|h| h.started())
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Reaps the shared worker's exit status, polling up to `timeout`.
    ///
    /// Returns true if the worker is reaped (or was never forked, or was
    /// already reaped elsewhere), false if it is still running at the
    /// deadline.
    ///
    /// # Errors
    /// Returns an error for unexpected waitpid failures.
    #[cfg(unix)]
    pub fn reap_subprocess(&self, timeout: Duration) -> Result<bool> {
        use nix::errno::Errno;
        use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
        use nix::unistd::Pid;

        let Some(pid) = self.subprocess_pid() else {
            return Ok(true);
        };
        #[allow(clippy::cast_possible_wrap)] // pids fit in i32 range
        let pid = Pid::from_raw(pid as i32);
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    tracing::debug!(?status, "reaped shared worker");
                    return Ok(true);
                }
                Err(Errno::EINTR) => {}
                // Already reaped (or inherited by a wait in other code)
                Err(Errno::ECHILD) => return Ok(true),
                Err(err) => return Err(WatcherError::os(err)),
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherRegistry")
            .field("count", &self.count())
            .field("is_subprocess", &self.is_subprocess())
            .finish_non_exhaustive()
    }
}
