//! Configuration types and helpers.

mod daemon_config;
mod defaults;
mod driver;
mod snapshotter;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use daemon_config::*;
pub use defaults::*;
pub use driver::*;
pub use snapshotter::*;
