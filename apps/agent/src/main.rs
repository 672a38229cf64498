//! twinsync device agent entry point.
//!
//! Usage: `twinsync-agent [CONFIG_PATH]`

mod app;
mod blob;
mod config;
mod file_twin;
mod provisioner;
mod spool;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting twinsync agent"
    );

    let config_path = std::env::args_os().nth(1).map(std::path::PathBuf::from);
    let config = config::Config::load(config_path)?;
    tracing::info!(device_id = %config.device_id, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("agent shut down cleanly");
    Ok(())
}
