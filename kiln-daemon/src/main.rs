//! # kiln-daemon
//!
//! The Kiln host daemon.
//!
//! This daemon is responsible for:
//! - Discovering `.kpk` packages and loading them in dependency order
//! - Driving the host tick loop (scheduled tasks and registered systems)
//! - Hot-reloading plugins whose package changed on disk
//! - Quarantining plugins that exhaust their fault budget
//! - Unloading every plugin, dependents first, on ctrl-c
//!
//! ## Configuration
//!
//! The daemon reads configuration from `$XDG_CONFIG_HOME/kiln/config.toml`,
//! writing a documented default on first start.
//!
//! ## Running
//!
//! ```bash
//! # Start the daemon with shared-library plugin support
//! cargo run --bin kiln-daemon --features native
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin kiln-daemon
//! ```

use anyhow::{Context, Result};
use kiln_daemon::config::Config;
use kiln_daemon::supervisor::Supervisor;
use kiln_plugin_api::{HostAccess, ModuleLoader, PluginRuntime, StandaloneHost};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_error) = match Config::load_default() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting kiln-daemon v{}", env!("CARGO_PKG_VERSION"));
    match config_error {
        None => info!("Loaded configuration from default path"),
        Some(e) => warn!("Failed to load config, using defaults: {:#}", e),
    }

    let runtime_config = config.runtime_config()?;
    info!(
        plugins_dir = %runtime_config.plugins_dir.display(),
        data_dir = %runtime_config.data_dir.display(),
        "Runtime directories"
    );

    let host: Arc<dyn HostAccess> = Arc::new(StandaloneHost::new());
    let runtime = Arc::new(
        PluginRuntime::new(runtime_config, module_loader(), host)
            .context("Failed to initialise plugin runtime")?,
    );

    let loaded = runtime.scan_and_load().context("Plugin scan failed")?;
    info!("Loaded {} plugin(s): {:?}", loaded.len(), loaded);
    let scan = runtime.last_scan();
    for (id, reason) in scan.rejected.iter().chain(scan.failed.iter()) {
        warn!(plugin = %id, "Not loaded: {}", reason);
    }

    let mut supervisor = Supervisor::new(Arc::clone(&runtime), config.daemon.clone());
    supervisor.start()?;

    info!("Daemon startup complete");
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    supervisor.shutdown().await;
    runtime.shutdown();

    info!("Daemon stopped");
    Ok(())
}

#[cfg(feature = "native")]
fn module_loader() -> Arc<dyn ModuleLoader> {
    Arc::new(kiln_plugin_api::NativeModuleLoader::new())
}

#[cfg(not(feature = "native"))]
fn module_loader() -> Arc<dyn ModuleLoader> {
    warn!("Built without the `native` feature; only in-process plugins can load");
    Arc::new(kiln_plugin_api::InProcessModuleLoader::new())
}
