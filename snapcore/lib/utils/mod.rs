//! Utility functions and types.

mod digest;
mod mount;
mod path;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use digest::*;
pub use mount::*;
pub use path::*;
