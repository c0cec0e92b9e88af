//! The filesystem orchestrator.
//!
//! [`Filesystem`] decides how each snapshot is served. Fusedev snapshots go to a shared
//! daemon or to a daemon of their own, fscache snapshots always share one daemon, and
//! block-mode snapshots are mounted by the kernel over loop devices.

mod block;
mod fs;
mod mount;
mod recover;
mod resolver;
mod shared;
mod verifier;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use fs::*;
pub use resolver::*;
pub use verifier::*;
