use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default state root of the snapshotter.
pub const DEFAULT_ROOT_DIR: &str = "/var/lib/containerd-nydus";

/// The default daemon binary, resolved through `PATH`.
pub const DEFAULT_NYDUSD_PATH: &str = "nydusd";

/// The default conversion tool binary, resolved through `PATH`.
pub const DEFAULT_NYDUS_IMAGE_PATH: &str = "nydus-image";

/// The default daemon configuration template.
pub const DEFAULT_DAEMON_CONFIG_PATH: &str = "/etc/nydus/nydusd-config.json";

/// The default log level passed to daemons.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// The default interval between blob cache garbage collections.
pub const DEFAULT_GC_PERIOD: &str = "24h";

/// Number of attempts made while waiting for a daemon to reach a state.
pub const DAEMON_STATE_WAIT_ATTEMPTS: u32 = 20;

/// Interval between daemon state checks.
pub const DAEMON_STATE_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Number of attempts made while waiting for a daemon api socket to show up.
pub const DAEMON_SOCKET_WAIT_ATTEMPTS: u32 = 100;

/// How long a terminated daemon is given to exit before it is killed.
pub const DAEMON_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for the size of a manifest or image config fetched by the block-mode manager.
pub const MAX_MANIFEST_CONFIG_SIZE: u64 = 0x100000;
