//! Block-mode snapshots.
//!
//! Plain OCI tar layers are streamed from the registry into a local tar file while a
//! conversion tool builds erofs metadata for them. Images are served by merging the layer
//! metadata and mounting it over loop devices, with no userspace daemon involved.

#[cfg(test)]
mod fake;
mod loopdev;
mod manager;
mod status;
mod stream;
mod tool;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
pub(crate) use fake::*;
pub use loopdev::*;
pub use manager::*;
pub use status::*;
pub use stream::{detect_compression, Compression, StreamOutcome};
pub use tool::*;
