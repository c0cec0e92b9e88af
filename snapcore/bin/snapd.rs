use clap::Parser;
use snapcore::{cli::SnapdArgs, config::SnapshotterConfig, filesystem::Filesystem, SnapshotterResult};
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> SnapshotterResult<()> {
    let args = SnapdArgs::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::from_default_env(),
    };
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    let mut config = SnapshotterConfig::load(&args.config).await?;
    config.resolve_binaries()?;
    tracing::debug!("loaded config: path={}, config={config:?}", args.config.display());

    if args.check_config {
        tracing::info!("configuration is valid: path={}", args.config.display());
        return Ok(());
    }

    let fs = Filesystem::from_config(config).await?;
    tracing::info!("snapd ready: daemon_mode={}", fs.get_daemon_mode());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    if args.cleanup_on_close {
        fs.teardown().await;
        fs.try_stop_shared_daemons().await;
    }

    Ok(())
}
