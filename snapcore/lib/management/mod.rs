//! Daemon management: persistence, supervision, liveness and the per-driver daemon manager.

mod db;
mod manager;
mod monitor;
mod store;
mod supervisor;
mod table;
mod upgrade;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use db::*;
pub use manager::*;
pub use monitor::*;
pub use store::*;
pub use supervisor::*;
pub use table::*;
pub use upgrade::*;
