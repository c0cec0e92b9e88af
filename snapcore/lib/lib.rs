//! `snapcore` is the core of a container image snapshotter that serves lazily-pulled images.
//!
//! # Overview
//!
//! Image layers are not unpacked on disk. Instead each snapshot is backed by a filesystem
//! that fetches data on demand:
//! - a FUSE daemon, either one per snapshot or one shared by all of them
//! - an fscache daemon feeding the in-kernel erofs filesystem
//! - block-mode (tarfs) images, where plain OCI tar layers are mounted through loop devices
//!
//! # Architecture
//!
//! - **Daemons**: records of daemon processes, their control API and their state machine
//! - **Management**: per-driver daemon managers with persistence, supervision and recovery
//! - **Filesystem**: the orchestrator routing each mount to the right driver
//! - **Tarfs**: layer conversion, image merging and loop-device mounts
//! - **Cache**: blob cache accounting and removal
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//!
//! use snapcore::{config::SnapshotterConfig, filesystem::Filesystem, label};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SnapshotterConfig::load("/etc/nydus/config.toml").await?;
//!     let fs = Filesystem::from_config(config).await?;
//!
//!     let labels = HashMap::from([(
//!         label::CRI_IMAGE_REF.to_string(),
//!         "docker.io/library/busybox:latest".to_string(),
//!     )]);
//!     let mountpoint = fs.mount("snapshot-1", &labels).await?;
//!     fs.wait_until_ready("snapshot-1").await?;
//!     println!("mounted at {}", mountpoint.display());
//!
//!     fs.umount("snapshot-1").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Blob cache usage and removal
//! - [`cli`] - Command-line arguments of `snapd`
//! - [`config`] - Snapshotter and daemon configuration
//! - [`daemon`] - Daemon records, control API and mount instances
//! - [`filesystem`] - The mount orchestrator
//! - [`label`] - Snapshot labels
//! - [`management`] - Daemon managers, persistence and supervision
//! - [`oci`] - Image references and registry access
//! - [`tarfs`] - Block-mode snapshots
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cache;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod filesystem;
pub mod label;
pub mod management;
pub mod oci;
pub mod tarfs;
pub mod utils;

pub use error::*;
