//! Shared-worker (forked subprocess) lifecycle, end to end.
//!
//! These tests fork a real worker process and observe it from the
//! parent through the crate's own cross-process primitives: the write
//! queue for tick output, pipe signals for stop/done, and the liveness
//! probe plus waitpid for teardown.

#![cfg(unix)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use vigil_core::{
    DeferredLock, Poller, SerializedWriteQueue, Watcher, WatcherConfig, WatcherRegistry,
};

/// Poller that reports each tick through a cross-process queue.
struct ReportingPoller {
    queue: SerializedWriteQueue<u64>,
    seq: AtomicU64,
}

impl ReportingPoller {
    fn new(queue: SerializedWriteQueue<u64>) -> Self {
        Self {
            queue,
            seq: AtomicU64::new(0),
        }
    }
}

impl Poller for ReportingPoller {
    fn tick(&self) -> vigil_core::Result<()> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        self.queue.put(&n)
    }
}

// =============================================================================
// Worker lifecycle
// =============================================================================

#[test]
fn shared_worker_hosts_watcher_across_fork() {
    let registry = WatcherRegistry::new();
    let queue = SerializedWriteQueue::<u64>::new().unwrap();
    let watcher = Watcher::new(
        WatcherConfig::new("forked", Duration::from_millis(20)),
        ReportingPoller::new(queue.clone()),
    )
    .unwrap();
    registry.start(&watcher);

    registry.start_all(true, true).unwrap();
    assert!(registry.is_subprocess());
    assert!(registry.subprocess_started());
    let pid = registry.subprocess_pid().unwrap();
    assert_ne!(pid, std::process::id());
    assert!(registry.is_subprocess_alive());

    // Ticks happen in the worker; the queue is the only window into it
    let first = queue.get().unwrap();
    let second = queue.get().unwrap();
    assert_eq!(second, first + 1);
    assert!(registry.is_alive(&watcher));

    // Exactly one worker per registry: relaunch keeps the same pid
    registry.start_all(true, false).unwrap();
    assert_eq!(registry.subprocess_pid(), Some(pid));

    // Stop travels over the shared pipe signal; done travels back
    registry.stop(&watcher);
    registry.wait(&watcher, Some(Duration::from_secs(10)));
    assert!(watcher.signals().done().is_set());

    assert!(registry.reap_subprocess(Duration::from_secs(10)).unwrap());
    assert!(!registry.is_subprocess_alive());
    assert!(!registry.is_alive(&watcher));
}

#[test]
fn worker_with_no_armed_watchers_exits() {
    let registry = WatcherRegistry::new();
    registry.start_all(true, true).unwrap();
    assert!(registry.is_subprocess());

    // Nothing to host: the worker signals readiness and leaves
    assert!(registry.reap_subprocess(Duration::from_secs(10)).unwrap());
    assert!(!registry.is_subprocess_alive());
}

#[test]
fn reap_without_worker_is_trivially_done() {
    let registry = WatcherRegistry::new();
    assert!(registry.reap_subprocess(Duration::from_millis(10)).unwrap());
}

// =============================================================================
// Substrate boundary
// =============================================================================

#[test]
fn subprocess_launch_rejects_watcher_already_running_in_thread() {
    struct IdlePoller;
    impl Poller for IdlePoller {
        fn tick(&self) -> vigil_core::Result<()> {
            Ok(())
        }
    }

    let registry = WatcherRegistry::new();
    let watcher = Watcher::new(
        WatcherConfig::new("threaded", Duration::from_millis(10)),
        IdlePoller,
    )
    .unwrap();
    registry.start(&watcher);
    registry.start_all(false, false).unwrap();

    // Signals can only be swapped before the loop ever runs
    assert!(registry.start_all(true, false).is_err());
    assert!(!registry.is_subprocess());

    registry.stop(&watcher);
    registry.wait(&watcher, Some(Duration::from_secs(5)));
}

// =============================================================================
// Fork-tolerant locking
// =============================================================================

/// Poller that must take a lock before reporting. If the worker's
/// inherited lock copy were stuck in the parent's held state, the first
/// tick would block forever and the queue would stay silent.
struct LockedPoller {
    lock: Arc<DeferredLock>,
    queue: SerializedWriteQueue<u64>,
}

impl Poller for LockedPoller {
    fn tick(&self) -> vigil_core::Result<()> {
        let _guard = self.lock.guard();
        self.queue.put(&1)
    }
}

#[test]
fn inherited_lock_is_rearmed_in_worker() {
    let registry = WatcherRegistry::new();
    let queue = SerializedWriteQueue::<u64>::new().unwrap();
    let lock = Arc::new(DeferredLock::new());
    lock.create();
    // Held by the parent at fork time
    lock.acquire();

    let watcher = Watcher::new(
        WatcherConfig::new("locked", Duration::from_millis(20)),
        LockedPoller {
            lock: Arc::clone(&lock),
            queue: queue.clone(),
        },
    )
    .unwrap();
    registry.start(&watcher);
    registry.start_all(true, true).unwrap();

    assert_eq!(queue.get().unwrap(), 1);

    lock.release();
    registry.stop(&watcher);
    registry.wait(&watcher, Some(Duration::from_secs(10)));
    assert!(registry.reap_subprocess(Duration::from_secs(10)).unwrap());
}
