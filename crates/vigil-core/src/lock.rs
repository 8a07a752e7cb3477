//! Lazily materialized, fork-aware locks.
//!
//! A [`DeferredLock`] can be declared at process-setup time, before any
//! fork has happened, without allocating its underlying lock. The first
//! `acquire` (or an explicit `create`) materializes it. Every live
//! instance is tracked by the process-wide [`LockRegistry`] so that a
//! freshly forked child can rearm them all: the child inherits a memory
//! copy of each lock, possibly frozen in a held state by a parent thread
//! that does not exist in the child, and a rearm swaps in a fresh,
//! unlocked lock.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Condvar, Mutex};

// =============================================================================
// RawLock
// =============================================================================

/// Binary (non-reentrant) lock with explicit lock/unlock.
///
/// Guard-free on purpose: `DeferredLock::release` may run far from the
/// acquire site, and the post-fork rearm must be able to abandon the lock
/// wholesale.
struct RawLock {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl RawLock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            locked: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cv.wait(&mut locked);
        }
        *locked = true;
    }

    fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock();
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock();
        *locked = false;
        self.cv.notify_one();
    }
}

// =============================================================================
// DeferredLock
// =============================================================================

struct LockCore {
    /// The materialized lock, or None until first use.
    slot: Mutex<Option<Arc<RawLock>>>,
    /// The lock object the current holder acquired. Kept separately from
    /// `slot` so a release still unlocks the right object even if a rearm
    /// swapped the slot in between.
    held: Mutex<Option<Arc<RawLock>>>,
}

impl LockCore {
    fn materialize(&self) -> Arc<RawLock> {
        let mut slot = self.slot.lock();
        slot.get_or_insert_with(RawLock::new).clone()
    }

    fn rearm(&self) {
        *self.held.lock() = None;
        let mut slot = self.slot.lock();
        if slot.is_some() {
            *slot = Some(RawLock::new());
        }
    }
}

/// A scoped mutual-exclusion resource created lazily.
///
/// `Clone`s share the same lock. Instances register themselves with the
/// process-wide [`LockRegistry`] on construction.
#[derive(Clone)]
pub struct DeferredLock {
    core: Arc<LockCore>,
}

impl DeferredLock {
    /// Creates a new deferred lock and registers it for post-fork rearm.
    #[must_use]
    pub fn new() -> Self {
        let lock = Self {
            core: Arc::new(LockCore {
                slot: Mutex::new(None),
                held: Mutex::new(None),
            }),
        };
        LockRegistry::global().register(&lock);
        lock
    }

    /// Materializes the underlying lock. Idempotent: repeated calls,
    /// including from multiple logical owners after a fork, allocate at
    /// most once per instance.
    pub fn create(&self) {
        let _ = self.core.materialize();
    }

    /// Returns true if the underlying lock has been materialized.
    #[must_use]
    pub fn is_created(&self) -> bool {
        self.core.slot.lock().is_some()
    }

    /// Acquires the lock, materializing it on first use. Blocks until
    /// available. Non-reentrant.
    pub fn acquire(&self) {
        let raw = self.core.materialize();
        raw.lock();
        *self.core.held.lock() = Some(raw);
    }

    /// Tries to acquire without blocking; returns true on success.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let raw = self.core.materialize();
        if raw.try_lock() {
            *self.core.held.lock() = Some(raw);
            true
        } else {
            false
        }
    }

    /// Releases the lock. A release without a prior acquire is a no-op.
    pub fn release(&self) {
        if let Some(raw) = self.core.held.lock().take() {
            raw.unlock();
        }
    }

    /// Acquires and returns a guard that releases on drop, including
    /// during unwinding.
    #[must_use]
    pub fn guard(&self) -> DeferredLockGuard<'_> {
        self.acquire();
        DeferredLockGuard { lock: self }
    }
}

impl Default for DeferredLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeferredLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredLock")
            .field("created", &self.is_created())
            .finish()
    }
}

/// RAII guard for a [`DeferredLock`].
pub struct DeferredLockGuard<'a> {
    lock: &'a DeferredLock,
}

impl Drop for DeferredLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

// =============================================================================
// LockRegistry
// =============================================================================

/// Process-wide registry of every live [`DeferredLock`].
///
/// Holds weak references only; dropped locks are pruned on the next
/// sweep. The registry exists so a forked child can fix up all locks in
/// one call without knowing who declared them.
pub struct LockRegistry {
    locks: Mutex<Vec<Weak<LockCore>>>,
}

static GLOBAL_LOCK_REGISTRY: OnceLock<LockRegistry> = OnceLock::new();

impl LockRegistry {
    /// Returns the process-wide registry.
    pub fn global() -> &'static Self {
        GLOBAL_LOCK_REGISTRY.get_or_init(|| Self {
            locks: Mutex::new(Vec::new()),
        })
    }

    fn register(&self, lock: &DeferredLock) {
        let mut locks = self.locks.lock();
        locks.retain(|weak| weak.strong_count() > 0);
        locks.push(Arc::downgrade(&lock.core));
    }

    /// Number of live registered locks.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut locks = self.locks.lock();
        locks.retain(|weak| weak.strong_count() > 0);
        locks.len()
    }

    /// Returns true if no live locks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materializes every registered lock (idempotent per instance).
    pub fn create_all(&self) {
        let locks = self.locks.lock();
        for weak in locks.iter() {
            if let Some(core) = weak.upgrade() {
                let _ = core.materialize();
            }
        }
    }

    /// Replaces every materialized lock with a fresh, unlocked one and
    /// forgets any held state. Must only run where no other thread can be
    /// inside one of these locks — in practice, immediately after a fork,
    /// where the child owns the sole thread.
    pub fn rearm_all(&self) {
        let locks = self.locks.lock();
        let mut rearmed = 0usize;
        for weak in locks.iter() {
            if let Some(core) = weak.upgrade() {
                core.rearm();
                rearmed += 1;
            }
        }
        tracing::debug!(count = rearmed, "rearmed deferred locks after fork");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lazy_creation() {
        let lock = DeferredLock::new();
        assert!(!lock.is_created());
        lock.acquire();
        assert!(lock.is_created());
        lock.release();
    }

    #[test]
    fn test_create_idempotent() {
        let lock = DeferredLock::new();
        lock.create();
        lock.create();
        assert!(lock.is_created());
        // Still a usable lock after double-create
        lock.acquire();
        lock.release();
        lock.acquire();
        lock.release();
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let lock = DeferredLock::new();
        lock.release();
        assert!(!lock.is_created());
    }

    #[test]
    fn test_mutual_exclusion() {
        let lock = DeferredLock::new();
        lock.acquire();
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lock = DeferredLock::new();
        {
            let _guard = lock.guard();
            assert!(!lock.clone().try_acquire());
        }
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_contended_acquire_unblocks() {
        let lock = DeferredLock::new();
        lock.acquire();
        let lock2 = lock.clone();
        let waiter = std::thread::spawn(move || {
            lock2.acquire();
            lock2.release();
        });
        std::thread::sleep(Duration::from_millis(10));
        lock.release();
        waiter.join().unwrap();
    }

    // Rearm/create-all tests use a private registry: rearming through the
    // global one would also rearm locks owned by concurrently running
    // tests.
    fn private_registry() -> LockRegistry {
        LockRegistry {
            locks: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_rearm_unsticks_inherited_lock() {
        // Simulate a fork that copied the lock while held: rearm must
        // leave it acquirable.
        let registry = private_registry();
        let lock = DeferredLock::new();
        registry.register(&lock);
        lock.acquire();
        registry.rearm_all();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_rearm_skips_unmaterialized() {
        let registry = private_registry();
        let lock = DeferredLock::new();
        registry.register(&lock);
        registry.rearm_all();
        assert!(!lock.is_created());
    }

    #[test]
    fn test_registry_tracks_and_prunes() {
        // The global registry's length is not stable across parallel tests
        let registry = private_registry();
        let lock = DeferredLock::new();
        registry.register(&lock);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
        drop(lock);
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_create_all_materializes() {
        let registry = private_registry();
        let lock = DeferredLock::new();
        registry.register(&lock);
        registry.create_all();
        assert!(lock.is_created());
    }
}
