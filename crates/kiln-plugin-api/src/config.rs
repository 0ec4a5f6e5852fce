//! Runtime configuration.
//!
//! Every limit the hosting runtime enforces lives here so a host can load it
//! from the `[runtime]` table of its own config file.

use kiln_runtime::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory scanned for `.kpk` packages.
    pub plugins_dir: PathBuf,

    /// Root for plugin data, the staging cache and reload checkpoints.
    pub data_dir: PathBuf,

    /// Largest package the runtime will stage, in bytes.
    pub max_package_bytes: u64,

    pub adapters: AdapterSecurityConfig,
    pub metrics: MetricsThresholds,
    pub fault_budget: FaultBudgetPolicy,
    pub scheduler: SchedulerConfig,
    pub isolation: SystemIsolationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            data_dir: PathBuf::from("data"),
            max_package_bytes: 64 * 1024 * 1024,
            adapters: AdapterSecurityConfig::default(),
            metrics: MetricsThresholds::default(),
            fault_budget: FaultBudgetPolicy::default(),
            scheduler: SchedulerConfig::default(),
            isolation: SystemIsolationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Configuration rooted at the given directories, defaults elsewhere.
    pub fn new(plugins_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Check that every limit is usable.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.max_package_bytes == 0 {
            return Err(invalid("max_package_bytes must be greater than 0"));
        }
        self.adapters.validate()?;
        self.metrics.validate()?;
        self.fault_budget.validate()?;

        if self.scheduler.max_tasks_per_plugin == 0 {
            return Err(invalid("scheduler.max_tasks_per_plugin must be greater than 0"));
        }
        if self.isolation.failure_threshold == 0 {
            return Err(invalid("isolation.failure_threshold must be greater than 0"));
        }
        if self.isolation.base_cooldown_ticks == 0
            || self.isolation.max_cooldown_ticks < self.isolation.base_cooldown_ticks
        {
            return Err(invalid(
                "isolation cooldown must satisfy 0 < base_cooldown_ticks <= max_cooldown_ticks",
            ));
        }
        Ok(())
    }
}

/// How adapter bodies are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Run on a separate task under the invocation timeout.
    Safe,
    /// Run inline on the caller's task with no timeout.
    Fast,
}

/// Named payload limit presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadPreset {
    Strict,
    Balanced,
    Perf,
}

/// Limits applied to every adapter invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSecurityConfig {
    pub max_payload_entries: usize,
    pub max_payload_key_chars: usize,
    pub max_payload_value_chars: usize,
    pub max_payload_total_chars: usize,

    /// Calls per minute for each adapter. `0` disables the limit.
    pub max_calls_per_minute: usize,

    /// Calls per minute across all adapters of one plugin. `0` disables it.
    pub max_calls_per_minute_per_plugin: usize,

    /// Concurrent invocations per plugin. `0` disables the limit.
    pub max_concurrent_invocations: usize,

    pub invocation_timeout_millis: u64,
    pub execution_mode: ExecutionMode,
    pub audit_log_enabled: bool,
    pub audit_log_successes: bool,
}

impl Default for AdapterSecurityConfig {
    fn default() -> Self {
        Self {
            max_payload_entries: 32,
            max_payload_key_chars: 64,
            max_payload_value_chars: 512,
            max_payload_total_chars: 4096,
            max_calls_per_minute: 180,
            max_calls_per_minute_per_plugin: 0,
            max_concurrent_invocations: 0,
            invocation_timeout_millis: 250,
            execution_mode: ExecutionMode::Safe,
            audit_log_enabled: true,
            audit_log_successes: false,
        }
    }
}

impl AdapterSecurityConfig {
    /// Replace the payload limits with a preset.
    pub fn with_preset(mut self, preset: PayloadPreset) -> Self {
        let (entries, key, value, total) = match preset {
            PayloadPreset::Strict => (16, 48, 256, 2048),
            PayloadPreset::Balanced => (32, 64, 512, 4096),
            PayloadPreset::Perf => (64, 96, 1024, 8192),
        };
        self.max_payload_entries = entries;
        self.max_payload_key_chars = key;
        self.max_payload_value_chars = value;
        self.max_payload_total_chars = total;
        self
    }

    fn validate(&self) -> RuntimeResult<()> {
        if self.max_payload_entries == 0
            || self.max_payload_key_chars == 0
            || self.max_payload_value_chars == 0
            || self.max_payload_total_chars == 0
        {
            return Err(invalid("adapter payload limits must be greater than 0"));
        }
        if self.execution_mode == ExecutionMode::Safe && self.invocation_timeout_millis == 0 {
            return Err(invalid(
                "adapters.invocation_timeout_millis must be greater than 0 in safe mode",
            ));
        }
        Ok(())
    }
}

/// When a system or adapter shows up in a profile as a hotspot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsThresholds {
    pub min_system_runs: u64,
    pub slow_system_avg_millis: f64,
    pub slow_system_max_millis: f64,
    pub system_failure_rate: f64,
    pub min_adapter_invocations: u64,
    pub adapter_timeout_rate: f64,
    pub adapter_failure_rate: f64,
    pub adapter_denied_rate: f64,
}

impl Default for MetricsThresholds {
    fn default() -> Self {
        Self {
            min_system_runs: 20,
            slow_system_avg_millis: 2.0,
            slow_system_max_millis: 10.0,
            system_failure_rate: 0.05,
            min_adapter_invocations: 20,
            adapter_timeout_rate: 0.02,
            adapter_failure_rate: 0.05,
            adapter_denied_rate: 0.25,
        }
    }
}

impl MetricsThresholds {
    fn validate(&self) -> RuntimeResult<()> {
        let rates = [
            self.system_failure_rate,
            self.adapter_timeout_rate,
            self.adapter_failure_rate,
            self.adapter_denied_rate,
        ];
        if rates.iter().any(|r| !(0.0..=1.0).contains(r)) {
            return Err(invalid("metrics rates must be within 0.0..=1.0"));
        }
        if self.slow_system_avg_millis <= 0.0 || self.slow_system_max_millis <= 0.0 {
            return Err(invalid("metrics slow-system thresholds must be positive"));
        }
        Ok(())
    }
}

/// Rolling fault budget applied to each plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultBudgetPolicy {
    pub max_faults_per_window: u64,
    pub window_millis: u64,
    pub warn_ratio: f64,
    pub throttle_ratio: f64,
    pub isolate_ratio: f64,
}

impl Default for FaultBudgetPolicy {
    fn default() -> Self {
        Self {
            max_faults_per_window: 100,
            window_millis: 60_000,
            warn_ratio: 0.6,
            throttle_ratio: 0.8,
            isolate_ratio: 1.0,
        }
    }
}

impl FaultBudgetPolicy {
    fn validate(&self) -> RuntimeResult<()> {
        if self.max_faults_per_window == 0 || self.window_millis == 0 {
            return Err(invalid("fault_budget window and limit must be greater than 0"));
        }
        if !(0.0 < self.warn_ratio
            && self.warn_ratio <= self.throttle_ratio
            && self.throttle_ratio <= self.isolate_ratio)
        {
            return Err(invalid(
                "fault_budget ratios must satisfy 0 < warn <= throttle <= isolate",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_tasks_per_plugin: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_plugin: 256,
        }
    }
}

/// Backoff for tick systems that keep failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemIsolationConfig {
    /// Consecutive failures before a system is skipped.
    pub failure_threshold: u32,
    /// Ticks skipped the first time; doubles with each re-isolation.
    pub base_cooldown_ticks: u64,
    pub max_cooldown_ticks: u64,
}

impl Default for SystemIsolationConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown_ticks: 2,
            max_cooldown_ticks: 64,
        }
    }
}

impl SystemIsolationConfig {
    /// Ticks to skip at the given isolation level (0-based).
    pub fn cooldown_for(&self, level: u32) -> u64 {
        let factor = 1u64.checked_shl(level.min(32)).unwrap_or(u64::MAX);
        self.base_cooldown_ticks
            .saturating_mul(factor)
            .min(self.max_cooldown_ticks)
    }
}

fn invalid(message: &str) -> RuntimeError {
    RuntimeError::InvalidConfig(message.to_string())
}
