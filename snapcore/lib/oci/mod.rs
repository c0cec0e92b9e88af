//! Image references and registry access.
//!
//! Block-mode layers are fetched straight from the registry, so this module provides a
//! reference parser plus a small registry client for manifests, configs and layer blobs.

mod reference;
mod registry;
mod traits;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use reference::*;
pub use registry::*;
pub use traits::*;
