use std::path::PathBuf;

use clap::Parser;

use super::styles;

//-------------------------------------------------------------------------------------------------
// Constants
//-------------------------------------------------------------------------------------------------

/// The configuration file read when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nydus/config.toml";

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// snapd - Serves lazily-pulled container image snapshots through filesystem daemons
#[derive(Debug, Parser)]
#[command(name = "snapd", author, about, version, styles=styles::styles())]
pub struct SnapdArgs {
    /// Path to the snapshotter configuration
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log filter, overrides `RUST_LOG`
    #[arg(short = 'L', long, value_name = "FILTER")]
    pub log_level: Option<String>,

    /// Unmount every snapshot and stop idle shared daemons on exit
    #[arg(long)]
    pub cleanup_on_close: bool,

    /// Check the configuration and exit
    #[arg(long)]
    pub check_config: bool,
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = SnapdArgs::parse_from(["snapd"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(args.log_level.is_none());
        assert!(!args.cleanup_on_close);
    }

    #[test]
    fn test_flags() {
        let args = SnapdArgs::parse_from([
            "snapd",
            "--config",
            "/tmp/snapd.toml",
            "-L",
            "snapcore=debug",
            "--cleanup-on-close",
        ]);
        assert_eq!(args.config, PathBuf::from("/tmp/snapd.toml"));
        assert_eq!(args.log_level.as_deref(), Some("snapcore=debug"));
        assert!(args.cleanup_on_close);
    }
}
