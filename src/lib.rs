//! Vigil: background watcher coordination for Unix services.
//!
//! Run periodic monitoring loops as in-process threads or inside one
//! shared forked worker process, with fork-tolerant signals, locks, and
//! a non-blocking cross-process write queue.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use vigil::prelude::*;
//!
//! // Re-exports from sub-crates for convenience
//! ```

pub use vigil_core as core;
pub use vigil_platform as platform;

/// Prelude module for common imports.
pub mod prelude {
    pub use vigil_core::{
        DeferredLock, Event, ExecutionMode, Poller, RegistryConfig, SignalSet, Watcher,
        WatcherConfig, WatcherId, WatcherRegistry, WatcherState,
    };
    #[cfg(unix)]
    pub use vigil_core::{SerializedWriteQueue, SubprocessHandle};
    pub use vigil_platform::{Liveness, ProcessLivenessProbe, ProcessStatus};
}
