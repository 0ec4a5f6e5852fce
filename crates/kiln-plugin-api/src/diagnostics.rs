//! A serializable snapshot of the runtime's state.

use crate::metrics::{FaultBudgetSnapshot, PluginRuntimeProfile};
use crate::registry::{IsolatedSystem, RegistrySummary};
use crate::runtime::{PluginRuntime, ScanReport};
use kiln_runtime::resolver::{resolve, DependencyDiagnostic};
use kiln_runtime::{DependencyKind, PluginDescriptor};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Health of one loaded plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginPerformance {
    pub profile: Option<PluginRuntimeProfile>,
    pub fault_budget: FaultBudgetSnapshot,
    pub isolated_systems: Vec<IsolatedSystem>,
    pub host_denials: u64,
    pub registry: RegistrySummary,
    pub adapters: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeDiagnostics {
    pub tick: u64,
    pub loaded_plugins: Vec<String>,
    pub load_order: Vec<String>,
    /// Problems the loaded set has when resolved against itself, e.g. after a
    /// dependency was unloaded.
    pub dependency_issues: BTreeMap<String, String>,
    pub version_mismatches: BTreeMap<String, String>,
    pub api_compatibility: BTreeMap<String, String>,
    pub dependency_diagnostics: BTreeMap<String, DependencyDiagnostic>,
    pub last_scan: ScanReport,
    /// Loaded plugin id to the loaded plugins it depends on.
    pub dependency_graph: BTreeMap<String, Vec<String>>,
    pub performance: BTreeMap<String, PluginPerformance>,
}

impl PluginRuntime {
    pub fn diagnostics(&self) -> RuntimeDiagnostics {
        let tick = self.current_tick();
        let load_order = self.loaded_plugin_ids();

        let descriptors: Vec<PluginDescriptor> = load_order
            .iter()
            .filter_map(|id| {
                let loaded = self.loaded.get(id)?;
                Some(PluginDescriptor::new(
                    (*loaded.manifest).clone(),
                    loaded.source_path.clone(),
                ))
            })
            .collect();
        let current = resolve(&descriptors, &HashMap::new());

        let loaded_ids: HashSet<&String> = load_order.iter().collect();
        let mut dependency_graph = BTreeMap::new();
        let mut performance = BTreeMap::new();
        for id in &load_order {
            let Some(loaded) = self.loaded.get(id) else {
                continue;
            };
            let mut edges: Vec<String> = loaded
                .manifest
                .dependencies
                .iter()
                .filter(|d| matches!(d.kind, DependencyKind::Required | DependencyKind::Optional))
                .filter(|d| loaded_ids.contains(&d.id))
                .map(|d| d.id.clone())
                .collect();
            edges.sort();
            dependency_graph.insert(id.clone(), edges);

            let context = &loaded.context;
            performance.insert(
                id.clone(),
                PluginPerformance {
                    profile: self.metrics.profile(id),
                    fault_budget: self.metrics.fault_budget(id),
                    isolated_systems: context.registry.isolated_systems(tick),
                    host_denials: context.host.denials(),
                    registry: context.registry.summary(),
                    adapters: context.adapters.len(),
                },
            );
        }

        RuntimeDiagnostics {
            tick,
            loaded_plugins: {
                let mut ids = load_order.clone();
                ids.sort();
                ids
            },
            load_order,
            dependency_issues: current.rejected,
            version_mismatches: current.version_mismatches,
            api_compatibility: current.api_compatibility,
            dependency_diagnostics: current.diagnostics,
            last_scan: self.last_scan(),
            dependency_graph,
            performance,
        }
    }
}
