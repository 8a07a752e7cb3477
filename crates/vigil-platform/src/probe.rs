//! Liveness probing for a forked worker process.
//!
//! A worker child can die at any moment, and it can die in two different
//! shapes: fully reaped (its `/proc` entry is gone) or zombied (exited but
//! not yet waited on). The probe answers "is it still doing work?" without
//! ever raising for either shape. When the direct pid lookup fails it
//! falls back to walking the recorded parent's descendant tree, and when
//! even the parent cannot be found the answer is indeterminate rather
//! than a hard no.

use crate::error::Result;
use crate::proc;

/// Tri-state liveness verdict for the shared worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The worker exists and is not a zombie.
    Alive,
    /// The worker has exited (zombied or fully reaped).
    Exited,
    /// Neither the worker nor its recorded parent could be located;
    /// nothing can be concluded. Treated as not-alive by callers.
    Unknown,
}

impl Liveness {
    /// Returns true only for a positively confirmed live worker.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }
}

/// Probe for one forked worker, remembering who forked it.
///
/// The parent pid anchors the fallback path: if `/proc/{child}` has
/// already disappeared, the child may still be visible as a descendant of
/// the parent under a different view of the process table (pid namespaces,
/// racing reaps), so the tree walk is tried before concluding anything.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLivenessProbe {
    child: u32,
    parent: u32,
}

impl ProcessLivenessProbe {
    /// Creates a probe for `child`, forked by `parent`.
    #[must_use]
    pub const fn new(child: u32, parent: u32) -> Self {
        Self { child, parent }
    }

    /// Returns the pid being probed.
    #[must_use]
    pub const fn child(&self) -> u32 {
        self.child
    }

    /// Probes the worker's liveness.
    ///
    /// Direct `/proc/{child}` lookup first; on failure, the descendant
    /// walk of the parent. Never errors: an unreadable process table
    /// degrades to [`Liveness::Unknown`].
    #[must_use]
    pub fn probe(&self) -> Liveness {
        match self.probe_direct() {
            Ok(liveness) => liveness,
            Err(err) => {
                tracing::debug!(
                    child = self.child,
                    parent = self.parent,
                    error = %err,
                    "direct liveness check failed, scanning parent tree"
                );
                self.probe_via_parent_tree()
            }
        }
    }

    /// Direct check: the stat entry must exist, belong to our parent, and
    /// not be a zombie.
    fn probe_direct(&self) -> Result<Liveness> {
        let st = proc::stat(self.child)?;
        if st.status.is_zombie() {
            return Ok(Liveness::Exited);
        }
        if st.ppid != self.parent {
            // The pid was recycled by an unrelated process; fall back to
            // the tree walk for a verdict on the worker we forked.
            return Err(crate::error::PlatformError::NotFound(self.child));
        }
        Ok(Liveness::Alive)
    }

    /// Fallback: locate the child among the parent's descendants.
    fn probe_via_parent_tree(&self) -> Liveness {
        if !proc::exists(self.parent) {
            return Liveness::Unknown;
        }
        let Ok(descendants) = proc::descendants(self.parent) else {
            return Liveness::Unknown;
        };
        if !descendants.contains(&self.child) {
            return Liveness::Exited;
        }
        match proc::stat(self.child) {
            Ok(st) if !st.status.is_zombie() => Liveness::Alive,
            // Zombied, or it vanished between the walk and the stat.
            _ => Liveness::Exited,
        }
    }
}
