//! Per-plugin runtime metrics and fault budgets.
//!
//! Counters are plain atomics so the tick loop and adapter tasks can record
//! without contending. Profiles are computed on demand from a snapshot of the
//! counters.

use crate::config::{FaultBudgetPolicy, MetricsThresholds};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How an adapter invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterOutcome {
    Accepted,
    Denied,
    Timeout,
    Failed,
}

/// Escalation stage of a plugin's fault budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultBudgetStage {
    Normal,
    Warn,
    Throttle,
    Isolate,
}

#[derive(Debug, Default)]
struct TimingCounter {
    runs: AtomicU64,
    failures: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

impl TimingCounter {
    fn record(&self, elapsed: Duration, success: bool) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.runs.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct AdapterCounter {
    total: AtomicU64,
    accepted: AtomicU64,
    denied: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

#[derive(Debug, Default)]
struct PluginMetrics {
    systems: DashMap<String, Arc<TimingCounter>>,
    adapters: DashMap<String, Arc<AdapterCounter>>,
    unknown_adapter_calls: AtomicU64,
    faults: Mutex<VecDeque<(Instant, String)>>,
}

/// Timing snapshot of one tick system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub id: String,
    pub runs: u64,
    pub failures: u64,
    pub total_nanos: u64,
    pub max_nanos: u64,
}

impl SystemStats {
    pub fn avg_millis(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.total_nanos as f64 / self.runs as f64 / 1_000_000.0
        }
    }

    pub fn max_millis(&self) -> f64 {
        self.max_nanos as f64 / 1_000_000.0
    }

    pub fn failure_rate(&self) -> f64 {
        ratio(self.failures, self.runs)
    }
}

/// Outcome counters of one adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterStats {
    pub id: String,
    pub total: u64,
    pub accepted: u64,
    pub denied: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub total_nanos: u64,
    pub max_nanos: u64,
}

impl AdapterStats {
    pub fn timeout_rate(&self) -> f64 {
        ratio(self.timeouts, self.total)
    }

    pub fn failure_rate(&self) -> f64 {
        ratio(self.failures, self.total)
    }

    pub fn denied_rate(&self) -> f64 {
        ratio(self.denied, self.total)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowSystem {
    pub id: String,
    pub runs: u64,
    pub avg_millis: f64,
    pub max_millis: f64,
    pub failure_rate: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterHotspot {
    pub id: String,
    pub total: u64,
    pub timeout_rate: f64,
    pub failure_rate: f64,
    pub denied_rate: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultBudgetSnapshot {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub window_millis: u64,
    pub stage: FaultBudgetStage,
    /// Fault count per source (`system:<id>`, `adapter:<id>`, ...) inside the window.
    pub sources: BTreeMap<String, u64>,
}

/// Everything the runtime knows about one plugin's behaviour.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginRuntimeProfile {
    pub plugin_id: String,
    pub systems: Vec<SystemStats>,
    pub adapters: Vec<AdapterStats>,
    pub slow_systems: Vec<SlowSystem>,
    pub adapter_hotspots: Vec<AdapterHotspot>,
    /// Calls naming an adapter the plugin never registered.
    pub unknown_adapter_denials: u64,
    pub fault_budget: FaultBudgetSnapshot,
}

/// Runtime-wide metrics store.
#[derive(Debug)]
pub struct RuntimeMetrics {
    thresholds: MetricsThresholds,
    fault_policy: FaultBudgetPolicy,
    plugins: DashMap<String, Arc<PluginMetrics>>,
}

impl RuntimeMetrics {
    pub fn new(thresholds: MetricsThresholds, fault_policy: FaultBudgetPolicy) -> Self {
        Self {
            thresholds,
            fault_policy,
            plugins: DashMap::new(),
        }
    }

    fn plugin(&self, plugin_id: &str) -> Arc<PluginMetrics> {
        if let Some(existing) = self.plugins.get(plugin_id) {
            return Arc::clone(&existing);
        }
        Arc::clone(
            &self
                .plugins
                .entry(plugin_id.to_string())
                .or_insert_with(|| Arc::new(PluginMetrics::default())),
        )
    }

    pub fn record_system_run(&self, plugin_id: &str, system_id: &str, elapsed: Duration, success: bool) {
        let plugin = self.plugin(plugin_id);
        let counter = Arc::clone(
            &plugin
                .systems
                .entry(system_id.to_string())
                .or_insert_with(|| Arc::new(TimingCounter::default())),
        );
        counter.record(elapsed, success);
    }

    pub fn record_adapter_invocation(
        &self,
        plugin_id: &str,
        adapter_id: &str,
        outcome: AdapterOutcome,
        elapsed: Duration,
    ) {
        let plugin = self.plugin(plugin_id);
        let counter = Arc::clone(
            &plugin
                .adapters
                .entry(adapter_id.to_string())
                .or_insert_with(|| Arc::new(AdapterCounter::default())),
        );
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        counter.total.fetch_add(1, Ordering::Relaxed);
        let bucket = match outcome {
            AdapterOutcome::Accepted => &counter.accepted,
            AdapterOutcome::Denied => &counter.denied,
            AdapterOutcome::Timeout => &counter.timeouts,
            AdapterOutcome::Failed => &counter.failures,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
        counter.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        counter.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn record_unknown_adapter(&self, plugin_id: &str) {
        self.plugin(plugin_id).unknown_adapter_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fault against a plugin's budget. Returns the stage afterwards.
    pub fn record_fault(&self, plugin_id: &str, source: &str) -> FaultBudgetStage {
        let plugin = self.plugin(plugin_id);
        let now = Instant::now();
        let mut faults = plugin.faults.lock();
        faults.push_back((now, source.to_string()));
        self.prune(&mut faults, now);
        self.stage_for(faults.len() as u64)
    }

    pub fn fault_budget(&self, plugin_id: &str) -> FaultBudgetSnapshot {
        let now = Instant::now();
        let mut sources = BTreeMap::new();
        let used = match self.plugins.get(plugin_id) {
            Some(plugin) => {
                let mut faults = plugin.faults.lock();
                self.prune(&mut faults, now);
                for (_, source) in faults.iter() {
                    *sources.entry(source.clone()).or_insert(0) += 1;
                }
                faults.len() as u64
            }
            None => 0,
        };
        let limit = self.fault_policy.max_faults_per_window;
        FaultBudgetSnapshot {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            window_millis: self.fault_policy.window_millis,
            stage: self.stage_for(used),
            sources,
        }
    }

    pub fn fault_stage(&self, plugin_id: &str) -> FaultBudgetStage {
        self.fault_budget(plugin_id).stage
    }

    /// Snapshot of one plugin, or `None` if nothing was ever recorded for it.
    pub fn profile(&self, plugin_id: &str) -> Option<PluginRuntimeProfile> {
        let plugin = self.plugins.get(plugin_id).map(|p| Arc::clone(&p))?;

        let mut systems: Vec<SystemStats> = plugin
            .systems
            .iter()
            .map(|entry| SystemStats {
                id: entry.key().clone(),
                runs: entry.runs.load(Ordering::Relaxed),
                failures: entry.failures.load(Ordering::Relaxed),
                total_nanos: entry.total_nanos.load(Ordering::Relaxed),
                max_nanos: entry.max_nanos.load(Ordering::Relaxed),
            })
            .collect();
        systems.sort_by(|a, b| a.id.cmp(&b.id));

        let mut adapters: Vec<AdapterStats> = plugin
            .adapters
            .iter()
            .map(|entry| AdapterStats {
                id: entry.key().clone(),
                total: entry.total.load(Ordering::Relaxed),
                accepted: entry.accepted.load(Ordering::Relaxed),
                denied: entry.denied.load(Ordering::Relaxed),
                timeouts: entry.timeouts.load(Ordering::Relaxed),
                failures: entry.failures.load(Ordering::Relaxed),
                total_nanos: entry.total_nanos.load(Ordering::Relaxed),
                max_nanos: entry.max_nanos.load(Ordering::Relaxed),
            })
            .collect();
        adapters.sort_by(|a, b| a.id.cmp(&b.id));

        let slow_systems = systems.iter().filter_map(|s| self.slow_system(s)).collect();
        let adapter_hotspots = adapters.iter().filter_map(|a| self.hotspot(a)).collect();

        Some(PluginRuntimeProfile {
            plugin_id: plugin_id.to_string(),
            systems,
            adapters,
            slow_systems,
            adapter_hotspots,
            unknown_adapter_denials: plugin.unknown_adapter_calls.load(Ordering::Relaxed),
            fault_budget: self.fault_budget(plugin_id),
        })
    }

    /// Drop every counter and fault recorded for a plugin.
    pub fn clear_plugin(&self, plugin_id: &str) {
        self.plugins.remove(plugin_id);
    }

    fn slow_system(&self, stats: &SystemStats) -> Option<SlowSystem> {
        let t = &self.thresholds;
        if stats.runs < t.min_system_runs {
            return None;
        }
        let mut reasons = Vec::new();
        if stats.avg_millis() >= t.slow_system_avg_millis {
            reasons.push(format!("avg {:.3}ms >= {}ms", stats.avg_millis(), t.slow_system_avg_millis));
        }
        if stats.max_millis() >= t.slow_system_max_millis {
            reasons.push(format!("max {:.3}ms >= {}ms", stats.max_millis(), t.slow_system_max_millis));
        }
        if stats.failure_rate() >= t.system_failure_rate {
            reasons.push(format!(
                "failure rate {:.3} >= {}",
                stats.failure_rate(),
                t.system_failure_rate
            ));
        }
        if reasons.is_empty() {
            return None;
        }
        Some(SlowSystem {
            id: stats.id.clone(),
            runs: stats.runs,
            avg_millis: stats.avg_millis(),
            max_millis: stats.max_millis(),
            failure_rate: stats.failure_rate(),
            reasons,
        })
    }

    fn hotspot(&self, stats: &AdapterStats) -> Option<AdapterHotspot> {
        let t = &self.thresholds;
        if stats.total < t.min_adapter_invocations {
            return None;
        }
        let mut reasons = Vec::new();
        if stats.timeout_rate() >= t.adapter_timeout_rate {
            reasons.push(format!("timeout rate {:.3} >= {}", stats.timeout_rate(), t.adapter_timeout_rate));
        }
        if stats.failure_rate() >= t.adapter_failure_rate {
            reasons.push(format!("failure rate {:.3} >= {}", stats.failure_rate(), t.adapter_failure_rate));
        }
        if stats.denied_rate() >= t.adapter_denied_rate {
            reasons.push(format!("denied rate {:.3} >= {}", stats.denied_rate(), t.adapter_denied_rate));
        }
        if reasons.is_empty() {
            return None;
        }
        Some(AdapterHotspot {
            id: stats.id.clone(),
            total: stats.total,
            timeout_rate: stats.timeout_rate(),
            failure_rate: stats.failure_rate(),
            denied_rate: stats.denied_rate(),
            reasons,
        })
    }

    fn prune(&self, faults: &mut VecDeque<(Instant, String)>, now: Instant) {
        let window = Duration::from_millis(self.fault_policy.window_millis);
        while let Some((at, _)) = faults.front() {
            if now.duration_since(*at) >= window {
                faults.pop_front();
            } else {
                break;
            }
        }
    }

    fn stage_for(&self, used: u64) -> FaultBudgetStage {
        let p = &self.fault_policy;
        let usage = used as f64 / p.max_faults_per_window as f64;
        if usage >= p.isolate_ratio {
            FaultBudgetStage::Isolate
        } else if usage >= p.throttle_ratio {
            FaultBudgetStage::Throttle
        } else if usage >= p.warn_ratio {
            FaultBudgetStage::Warn
        } else {
            FaultBudgetStage::Normal
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new(MetricsThresholds::default(), FaultBudgetPolicy::default())
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_budget() -> RuntimeMetrics {
        RuntimeMetrics::new(
            MetricsThresholds::default(),
            FaultBudgetPolicy {
                max_faults_per_window: 10,
                ..FaultBudgetPolicy::default()
            },
        )
    }

    #[test]
    fn test_fault_stages_escalate() {
        let metrics = small_budget();
        for _ in 0..5 {
            assert_eq!(metrics.record_fault("p", "system:s"), FaultBudgetStage::Normal);
        }
        assert_eq!(metrics.record_fault("p", "system:s"), FaultBudgetStage::Warn);
        metrics.record_fault("p", "adapter:a");
        assert_eq!(metrics.record_fault("p", "adapter:a"), FaultBudgetStage::Throttle);
        metrics.record_fault("p", "adapter:a");
        assert_eq!(metrics.record_fault("p", "adapter:a"), FaultBudgetStage::Isolate);

        let budget = metrics.fault_budget("p");
        assert_eq!(budget.used, 10);
        assert_eq!(budget.remaining, 0);
        assert_eq!(budget.sources.get("system:s"), Some(&6));
        assert_eq!(budget.sources.get("adapter:a"), Some(&4));
    }

    #[test]
    fn test_fault_window_expires() {
        let metrics = RuntimeMetrics::new(
            MetricsThresholds::default(),
            FaultBudgetPolicy {
                max_faults_per_window: 2,
                window_millis: 20,
                ..FaultBudgetPolicy::default()
            },
        );
        metrics.record_fault("p", "task:t");
        metrics.record_fault("p", "task:t");
        assert_eq!(metrics.fault_stage("p"), FaultBudgetStage::Isolate);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(metrics.fault_stage("p"), FaultBudgetStage::Normal);
    }

    #[test]
    fn test_slow_system_needs_min_runs() {
        let metrics = RuntimeMetrics::default();
        for _ in 0..19 {
            metrics.record_system_run("p", "slow", Duration::from_millis(5), true);
        }
        assert!(metrics.profile("p").unwrap().slow_systems.is_empty());

        metrics.record_system_run("p", "slow", Duration::from_millis(5), true);
        let profile = metrics.profile("p").unwrap();
        assert_eq!(profile.slow_systems.len(), 1);
        assert_eq!(profile.slow_systems[0].id, "slow");
    }

    #[test]
    fn test_adapter_hotspot_on_denials() {
        let metrics = RuntimeMetrics::default();
        for i in 0..20 {
            let outcome = if i % 2 == 0 {
                AdapterOutcome::Accepted
            } else {
                AdapterOutcome::Denied
            };
            metrics.record_adapter_invocation("p", "bank", outcome, Duration::from_micros(10));
        }
        let profile = metrics.profile("p").unwrap();
        assert_eq!(profile.adapters[0].accepted, 10);
        assert_eq!(profile.adapters[0].denied, 10);
        assert_eq!(profile.adapter_hotspots.len(), 1);
        assert!(profile.adapter_hotspots[0].reasons[0].contains("denied"));
    }

    #[test]
    fn test_clear_plugin() {
        let metrics = RuntimeMetrics::default();
        metrics.record_fault("p", "system:s");
        metrics.clear_plugin("p");
        assert!(metrics.profile("p").is_none());
        assert_eq!(metrics.fault_budget("p").used, 0);
    }
}
