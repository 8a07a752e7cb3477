//! Lifecycle signaling primitives.
//!
//! A watcher's lifecycle is driven by three binary events (stop, done,
//! started), each settable exactly once per run. Two flavors exist, one
//! per execution substrate:
//!
//! - [`ThreadEvent`] — an in-process flag (mutex + condvar). Cheap, but
//!   meaningless across a fork: the child gets a frozen copy nobody will
//!   ever signal.
//! - [`PipeEvent`] — an OS pipe where "readable" means "set". File
//!   descriptors are inherited across `fork`, so a parent setting the
//!   event is observed by the child and vice versa.
//!
//! [`SignalSet`] bundles the three events as a tagged variant: the kind is
//! chosen when the set is constructed and a watcher switching substrate
//! gets a whole new set, never a mutated one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::types::ExecutionMode;

#[cfg(unix)]
use crate::error::{Result, WatcherError};

// =============================================================================
// ThreadEvent
// =============================================================================

/// In-process binary event with a monotone unset→set transition.
///
/// Clones share state. `clear` exists only for rearming a watcher between
/// runs; a waiter never observes set→unset during a run.
#[derive(Clone, Default)]
pub struct ThreadEvent {
    inner: Arc<ThreadEventInner>,
}

#[derive(Default)]
struct ThreadEventInner {
    state: Mutex<bool>,
    cv: Condvar,
}

impl ThreadEvent {
    /// Creates a new unset event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event, waking all waiters.
    pub fn set(&self) {
        let mut state = self.inner.state.lock();
        if !*state {
            *state = true;
            self.inner.cv.notify_all();
        }
    }

    /// Returns true if the event is set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.inner.state.lock()
    }

    /// Resets the event to unset.
    pub fn clear(&self) {
        *self.inner.state.lock() = false;
    }

    /// Waits until the event is set or the timeout elapses.
    ///
    /// Returns the event's state at return; `None` waits indefinitely.
    #[must_use]
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.inner.state.lock();
        match timeout {
            None => {
                while !*state {
                    self.inner.cv.wait(&mut state);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*state {
                    if self.inner.cv.wait_until(&mut state, deadline).timed_out() {
                        return *state;
                    }
                }
                true
            }
        }
    }
}

impl std::fmt::Debug for ThreadEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadEvent")
            .field("set", &self.is_set())
            .finish()
    }
}

// =============================================================================
// PipeEvent
// =============================================================================

/// Fork-shareable binary event over an OS pipe.
///
/// Set means "the pipe has data": `set` writes one byte, waiters poll the
/// read end for readability and never consume, so every process sharing
/// the inherited descriptors observes the same state. `clear` drains.
///
/// OS failures on the signaling paths are logged and absorbed — a
/// lifecycle signal that cannot be delivered must degrade, not panic a
/// watcher loop (the explicit ignore-and-continue policy of the design).
#[cfg(unix)]
#[derive(Clone)]
pub struct PipeEvent {
    inner: Arc<PipeEventInner>,
}

#[cfg(unix)]
struct PipeEventInner {
    read: std::os::fd::OwnedFd,
    write: std::os::fd::OwnedFd,
}

#[cfg(unix)]
impl PipeEvent {
    /// Creates a new unset event.
    ///
    /// # Errors
    /// Returns an error if the pipe cannot be created.
    pub fn new() -> Result<Self> {
        use nix::fcntl::{FcntlArg, OFlag, fcntl};
        use std::os::fd::AsRawFd;

        let (read, write) = nix::unistd::pipe().map_err(WatcherError::os)?;
        // Non-blocking read end: is_set/clear must never stall, and waits
        // go through poll(2) anyway.
        let flags = fcntl(read.as_raw_fd(), FcntlArg::F_GETFL).map_err(WatcherError::os)?;
        let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
        fcntl(read.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(WatcherError::os)?;

        Ok(Self {
            inner: Arc::new(PipeEventInner { read, write }),
        })
    }

    /// Sets the event.
    ///
    /// Idempotent; concurrent setters may each write a byte, which is
    /// indistinguishable from a single set.
    pub fn set(&self) {
        use std::os::fd::AsFd;

        if self.is_set() {
            return;
        }
        loop {
            match nix::unistd::write(self.inner.write.as_fd(), &[1u8]) {
                Ok(_) => return,
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "pipe event set failed; signal dropped");
                    return;
                }
            }
        }
    }

    /// Returns true if the event is set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        matches!(self.poll_once(nix::poll::PollTimeout::ZERO), Ok(true))
    }

    /// Resets the event to unset by draining the pipe.
    pub fn clear(&self) {
        use std::os::fd::AsRawFd;

        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.inner.read.as_raw_fd(), &mut buf) {
                Ok(0) => return,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => {}
                Err(nix::errno::Errno::EAGAIN) => return,
                Err(err) => {
                    tracing::warn!(error = %err, "pipe event drain failed");
                    return;
                }
            }
        }
    }

    /// Waits until the event is set or the timeout elapses.
    ///
    /// Returns the event's state at return; `None` waits indefinitely.
    #[must_use]
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        use nix::poll::PollTimeout;

        let Some(timeout) = timeout else {
            // Indefinite wait, re-polled on EINTR.
            loop {
                match self.poll_once(PollTimeout::NONE) {
                    Ok(true) => return true,
                    Ok(false) | Err(nix::errno::Errno::EINTR) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "pipe event poll failed");
                        return false;
                    }
                }
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.is_set();
            }
            // poll(2) takes millisecond timeouts; chunk long waits.
            let chunk_ms = remaining.as_millis().min(60_000).max(1) as u16;
            match self.poll_once(PollTimeout::from(chunk_ms)) {
                Ok(true) => return true,
                Ok(false) | Err(nix::errno::Errno::EINTR) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "pipe event poll failed");
                    return false;
                }
            }
        }
    }

    /// One poll(2) round; Ok(true) means the read end is readable.
    fn poll_once(&self, timeout: nix::poll::PollTimeout) -> nix::Result<bool> {
        use nix::poll::{PollFd, PollFlags, poll};
        use std::os::fd::AsFd;

        let mut fds = [PollFd::new(self.inner.read.as_fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, timeout)?;
        if n == 0 {
            return Ok(false);
        }
        Ok(fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN)))
    }
}

#[cfg(unix)]
impl std::fmt::Debug for PipeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEvent")
            .field("set", &self.is_set())
            .finish()
    }
}

// =============================================================================
// Event / SignalSet
// =============================================================================

/// A lifecycle event of either flavor.
#[derive(Debug, Clone)]
pub enum Event {
    /// In-process event.
    Thread(ThreadEvent),
    /// Fork-shareable event.
    #[cfg(unix)]
    Pipe(PipeEvent),
}

impl Event {
    /// Sets the event.
    pub fn set(&self) {
        match self {
            Self::Thread(ev) => ev.set(),
            #[cfg(unix)]
            Self::Pipe(ev) => ev.set(),
        }
    }

    /// Returns true if the event is set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        match self {
            Self::Thread(ev) => ev.is_set(),
            #[cfg(unix)]
            Self::Pipe(ev) => ev.is_set(),
        }
    }

    /// Resets the event to unset.
    pub fn clear(&self) {
        match self {
            Self::Thread(ev) => ev.clear(),
            #[cfg(unix)]
            Self::Pipe(ev) => ev.clear(),
        }
    }

    /// Waits until the event is set or the timeout elapses.
    #[must_use]
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        match self {
            Self::Thread(ev) => ev.wait(timeout),
            #[cfg(unix)]
            Self::Pipe(ev) => ev.wait(timeout),
        }
    }
}

/// The three lifecycle signals of one watcher, all of one flavor.
///
/// Constructed per execution mode; a mode switch replaces the whole set.
#[derive(Debug, Clone)]
pub enum SignalSet {
    /// Thread-mode signals.
    Thread {
        /// Stop request.
        stop: ThreadEvent,
        /// Terminal-state marker.
        done: ThreadEvent,
        /// Set strictly before the first tick.
        started: ThreadEvent,
    },
    /// Subprocess-mode signals, shareable across the fork boundary.
    #[cfg(unix)]
    Subprocess {
        /// Stop request.
        stop: PipeEvent,
        /// Terminal-state marker.
        done: PipeEvent,
        /// Set strictly before the first tick.
        started: PipeEvent,
    },
}

impl SignalSet {
    /// Creates a thread-mode signal set.
    #[must_use]
    pub fn thread() -> Self {
        Self::Thread {
            stop: ThreadEvent::new(),
            done: ThreadEvent::new(),
            started: ThreadEvent::new(),
        }
    }

    /// Creates a subprocess-mode signal set.
    ///
    /// Must run before the fork so the child inherits the descriptors.
    ///
    /// # Errors
    /// Returns an error if a pipe cannot be created.
    #[cfg(unix)]
    pub fn subprocess() -> Result<Self> {
        Ok(Self::Subprocess {
            stop: PipeEvent::new()?,
            done: PipeEvent::new()?,
            started: PipeEvent::new()?,
        })
    }

    /// Returns the execution mode this set was built for.
    #[must_use]
    pub const fn mode(&self) -> ExecutionMode {
        match self {
            Self::Thread { .. } => ExecutionMode::Thread,
            #[cfg(unix)]
            Self::Subprocess { .. } => ExecutionMode::Subprocess,
        }
    }

    /// Returns the stop signal.
    #[must_use]
    pub fn stop(&self) -> Event {
        match self {
            Self::Thread { stop, .. } => Event::Thread(stop.clone()),
            #[cfg(unix)]
            Self::Subprocess { stop, .. } => Event::Pipe(stop.clone()),
        }
    }

    /// Returns the done signal.
    #[must_use]
    pub fn done(&self) -> Event {
        match self {
            Self::Thread { done, .. } => Event::Thread(done.clone()),
            #[cfg(unix)]
            Self::Subprocess { done, .. } => Event::Pipe(done.clone()),
        }
    }

    /// Returns the started signal.
    #[must_use]
    pub fn started(&self) -> Event {
        match self {
            Self::Thread { started, .. } => Event::Thread(started.clone()),
            #[cfg(unix)]
            Self::Subprocess { started, .. } => Event::Pipe(started.clone()),
        }
    }

    /// Rearms the set for a fresh run: clears stop and done.
    ///
    /// The started signal is left as-is; it only transitions on an actual
    /// spawn.
    pub fn rearm(&self) {
        self.stop().clear();
        self.done().clear();
    }
}
