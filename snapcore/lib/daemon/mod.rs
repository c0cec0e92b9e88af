//! Daemon records, their control API and the mount instances they serve.

mod client;
mod command;
#[allow(clippy::module_inception)]
mod daemon;
#[cfg(test)]
mod fake;
mod instance;
mod state;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use command::*;
pub use daemon::*;
#[cfg(test)]
pub(crate) use fake::*;
pub use instance::*;
pub use state::*;
