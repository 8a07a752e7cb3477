// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # vigil-platform
//!
//! Process inspection and liveness probing for the Vigil watcher
//! framework.
//!
//! This crate answers the one question the watcher registry cannot answer
//! from inside its own process: is the shared forked worker still alive?
//! That includes recognizing zombie children and recovering a verdict via
//! the parent's process tree when the worker's pid entry has already been
//! reaped.
//!
//! - [`proc`] — `/proc` parsing: run state, parent pid, descendants,
//!   attached tracer.
//! - [`ProcessLivenessProbe`] — tri-state [`Liveness`] probing with the
//!   descendant-walk fallback.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod proc;
pub mod probe;

pub use error::{PlatformError, Result};
pub use probe::{Liveness, ProcessLivenessProbe};
pub use proc::{ProcStat, ProcessStatus};
