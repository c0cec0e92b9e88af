//! `snaputils::runtime` is a module containing process runtime utilities for the snapcore project.

mod monitor;
mod supervisor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use monitor::*;
pub use supervisor::*;
