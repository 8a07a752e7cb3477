// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # vigil-core
//!
//! Background watcher coordination: run periodic monitoring loops as
//! in-process threads or inside one shared forked worker process.
//!
//! The central pieces:
//!
//! - [`Poller`] trait for the work a watcher performs each period
//! - [`Watcher`] for one periodic loop with stop/done/started signals
//! - [`WatcherRegistry`] for fleet lifecycle and the fork boundary
//! - [`SerializedWriteQueue`] for non-blocking cross-process handoff
//! - [`DeferredLock`] for fork-tolerant mutual exclusion
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vigil_core::{Poller, Watcher, WatcherConfig, WatcherRegistry};
//!
//! struct Heartbeat;
//!
//! impl Poller for Heartbeat {
//!     fn tick(&self) -> vigil_core::Result<()> {
//!         tracing::info!("still here");
//!         Ok(())
//!     }
//! }
//!
//! let registry = WatcherRegistry::new();
//! let watcher = Watcher::new(
//!     WatcherConfig::new("heartbeat", Duration::from_secs(5)),
//!     Heartbeat,
//! )?;
//! registry.start(&watcher);
//! registry.start_all(false, false)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Allow significant_drop_tightening - overly aggressive for lock-heavy code
#![allow(clippy::significant_drop_tightening)]

pub mod config;
pub mod error;
pub mod event;
pub mod lock;
#[cfg(unix)]
pub mod queue;
pub mod registry;
pub mod types;
pub mod watcher;

pub use config::{RegistryConfig, WatcherConfig};
pub use error::{Result, WatcherError};
pub use event::{Event, SignalSet, ThreadEvent};
#[cfg(unix)]
pub use event::PipeEvent;
pub use lock::{DeferredLock, DeferredLockGuard, LockRegistry};
#[cfg(unix)]
pub use queue::SerializedWriteQueue;
#[cfg(unix)]
pub use registry::SubprocessHandle;
pub use registry::{DetachHook, WatcherRegistry};
pub use types::{ExecutionMode, WatcherId, WatcherState};
pub use watcher::{Poller, Watcher};
