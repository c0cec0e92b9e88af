use std::path::PathBuf;

use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The subcommand a daemon is launched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSubcommand {
    /// A FUSE filesystem.
    Fuse,

    /// A singleton fscache service.
    Singleton,
}

/// Command line of a daemon process.
///
/// Options set to `None` are omitted from the rendered arguments.
#[derive(Debug, Clone, TypedBuilder)]
pub struct DaemonCommand {
    /// The subcommand.
    subcommand: DaemonSubcommand,

    /// Blob cache directory served through fscache.
    #[builder(default, setter(into))]
    fscache: Option<PathBuf>,

    /// Worker threads of the fscache service.
    #[builder(default, setter(into))]
    fscache_threads: Option<u32>,

    /// Worker threads of the FUSE service.
    #[builder(default, setter(into))]
    thread_num: Option<u32>,

    /// Daemon id, passed along with the supervisor.
    #[builder(default, setter(into))]
    id: Option<String>,

    /// Instance configuration of a dedicated daemon.
    #[builder(default, setter(into))]
    config: Option<PathBuf>,

    /// Bootstrap of a dedicated daemon.
    #[builder(default, setter(into))]
    bootstrap: Option<PathBuf>,

    /// FUSE mountpoint.
    #[builder(default, setter(into))]
    mountpoint: Option<PathBuf>,

    /// Control socket.
    #[builder(setter(into))]
    apisock: PathBuf,

    /// Log level.
    #[builder(setter(into))]
    log_level: String,

    /// Rotation size of the daemon's own log, in MiB.
    #[builder(default, setter(into))]
    log_rotation_size: Option<u64>,

    /// Supervisor socket used for failover and upgrades.
    #[builder(default, setter(into))]
    supervisor: Option<PathBuf>,

    /// Log file. The daemon logs to stdout when unset.
    #[builder(default, setter(into))]
    log_file: Option<PathBuf>,

    /// Whether the process takes over from a running daemon.
    #[builder(default)]
    upgrade: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DaemonSubcommand {
    /// The subcommand name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonSubcommand::Fuse => "fuse",
            DaemonSubcommand::Singleton => "singleton",
        }
    }
}

impl DaemonCommand {
    /// Renders the command line arguments, subcommand first.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![self.subcommand.as_str().to_string()];
        let mut param = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(format!("--{name}"));
                args.push(value);
            }
        };

        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());

        param("fscache", path(&self.fscache));
        param("fscache-threads", self.fscache_threads.map(|n| n.to_string()));
        param("thread-num", self.thread_num.map(|n| n.to_string()));
        param("id", self.id.clone());
        param("config", path(&self.config));
        param("bootstrap", path(&self.bootstrap));
        param("mountpoint", path(&self.mountpoint));
        param("apisock", Some(self.apisock.display().to_string()));
        param("log-level", Some(self.log_level.clone()));
        param(
            "log-rotation-size",
            self.log_rotation_size.map(|n| n.to_string()),
        );
        param("supervisor", path(&self.supervisor));
        param("log-file", path(&self.log_file));

        if self.upgrade {
            args.push("--upgrade".to_string());
        }

        args
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
