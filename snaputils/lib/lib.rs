//! `snaputils` is a library containing general utilities for the snapcore project.
//!
//! It provides the pieces of process plumbing that the snapshotter core builds on:
//! spawning and supervising daemon processes, checking process liveness, capturing
//! child output into size-bounded log files and serializing work per key.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod error;
pub mod lock;
pub mod log;
pub mod process;
pub mod runtime;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use lock::*;
pub use log::*;
pub use process::*;
pub use runtime::*;
