//! Configuration file loading and management
//!
//! This module loads the daemon configuration from
//! `$XDG_CONFIG_HOME/kiln/config.toml`. If the file doesn't exist, a default
//! configuration with documented comments is written first.

use anyhow::{Context, Result};
use kiln_plugin_api::RuntimeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Daemon-specific configuration
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Plugin runtime limits and directories
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Daemon loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`
    /// Default: "info"
    pub log_level: String,
    /// Milliseconds between host ticks
    /// Default: 50
    pub tick_interval_millis: u64,
    /// Seconds between checks for changed packages, 0 disables hot reload
    /// Default: 2
    pub reload_poll_seconds: u64,
    /// Unload plugins (and their dependents) whose fault budget reaches ISOLATE
    /// Default: true
    pub quarantine_on_isolate: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            tick_interval_millis: 50,
            reload_poll_seconds: 2,
            quarantine_on_isolate: true,
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Returns `$XDG_CONFIG_HOME/kiln/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Write the documented default configuration to `path`.
    pub fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    fn default_config_content() -> &'static str {
        r#"# Kiln Daemon Configuration
# This file configures the kiln-daemon behavior.

[daemon]
# Log level: trace, debug, info, warn, error
# RUST_LOG takes precedence when set.
# Default: "info"
log_level = "info"

# Milliseconds between host ticks
# Default: 50
tick_interval_millis = 50

# Seconds between checks for edited packages; 0 disables hot reload
# Default: 2
reload_poll_seconds = 2

# Unload a plugin and its dependents once its fault budget reaches ISOLATE
# Default: true
quarantine_on_isolate = true

[runtime]
# Relative paths are placed under $XDG_DATA_HOME/kiln
plugins_dir = "plugins"
data_dir = "data"

# Largest package staged, in bytes (64 MiB)
max_package_bytes = 67108864

[runtime.adapters]
# Payload limits; presets: strict (16/48/256/2048), balanced (32/64/512/4096),
# perf (64/96/1024/8192)
max_payload_entries = 32
max_payload_key_chars = 64
max_payload_value_chars = 512
max_payload_total_chars = 4096

# Calls per adapter per rolling minute; per-plugin and concurrency limits
# are disabled when 0
max_calls_per_minute = 180
max_calls_per_minute_per_plugin = 0
max_concurrent_invocations = 0

# "safe" runs adapters on a separate task with a timeout; "fast" runs inline
execution_mode = "safe"
invocation_timeout_millis = 250

audit_log_enabled = true
audit_log_successes = false

[runtime.fault_budget]
max_faults_per_window = 100
window_millis = 60000
warn_ratio = 0.6
throttle_ratio = 0.8
isolate_ratio = 1.0

# [runtime.scheduler]
# max_tasks_per_plugin = 256

# [runtime.isolation]
# failure_threshold = 3
# base_cooldown_ticks = 2
# max_cooldown_ticks = 64
"#
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.daemon.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.daemon.log_level,
                valid_log_levels.join(", ")
            );
        }

        if self.daemon.tick_interval_millis == 0 {
            anyhow::bail!("daemon.tick_interval_millis must be greater than 0");
        }

        self.runtime
            .validate()
            .context("Invalid [runtime] section")?;

        Ok(())
    }

    /// The runtime configuration with relative directories placed under
    /// `base`.
    pub fn runtime_config_under(&self, base: &Path) -> RuntimeConfig {
        let mut runtime = self.runtime.clone();
        if runtime.plugins_dir.is_relative() {
            runtime.plugins_dir = base.join(&runtime.plugins_dir);
        }
        if runtime.data_dir.is_relative() {
            runtime.data_dir = base.join(&runtime.data_dir);
        }
        runtime
    }

    /// The runtime configuration with relative directories placed under the
    /// XDG data directory.
    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        Ok(self.runtime_config_under(project_dirs()?.data_dir()))
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "kiln", "kiln").context("Failed to determine project directories")
}
