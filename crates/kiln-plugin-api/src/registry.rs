//! Content and system registries.
//!
//! Each plugin owns one [`PluginRegistry`]. Ids are unique within a kind and
//! a plugin; registering an id twice is an error that names both. Tick
//! systems run once per runtime tick in registration order, and a system that
//! keeps failing is skipped for a growing number of ticks.

use crate::config::SystemIsolationConfig;
use crate::metrics::RuntimeMetrics;
use crate::module::ModuleGuard;
use crate::plugin::call_guarded;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kiln_runtime::{RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

const MAX_ID_CHARS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDefinition {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub max_stack: u32,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ItemDefinition {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            max_stack: 64,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub hardness: f32,
    /// Item dropped when broken.
    #[serde(default)]
    pub drops: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeDefinition {
    pub id: String,
    pub inputs: Vec<(String, u32)>,
    pub output: (String, u32),
    #[serde(default)]
    pub duration_ticks: u64,
}

/// A tick system: called with the current tick.
pub type SystemFn = Arc<dyn Fn(u64) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct SystemHealth {
    consecutive_failures: u32,
    isolation_level: u32,
    skip_until_tick: u64,
}

struct RegisteredSystem {
    run: SystemFn,
    health: Mutex<SystemHealth>,
    _module: ModuleGuard,
}

/// A system currently skipped by isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolatedSystem {
    pub id: String,
    pub isolation_level: u32,
    pub resumes_at_tick: u64,
}

/// Counts of what a plugin registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub items: usize,
    pub blocks: usize,
    pub recipes: usize,
    pub systems: usize,
}

pub struct PluginRegistry {
    plugin_id: String,
    items: DashMap<String, ItemDefinition>,
    blocks: DashMap<String, BlockDefinition>,
    recipes: DashMap<String, RecipeDefinition>,
    systems: DashMap<String, Arc<RegisteredSystem>>,
    system_order: Mutex<Vec<String>>,
    module: ModuleGuard,
}

impl PluginRegistry {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            items: DashMap::new(),
            blocks: DashMap::new(),
            recipes: DashMap::new(),
            systems: DashMap::new(),
            system_order: Mutex::new(Vec::new()),
            module: ModuleGuard::none(),
        }
    }

    /// Pin `module` into every system registered from now on.
    pub fn with_module(mut self, module: ModuleGuard) -> Self {
        self.module = module;
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn register_item(&self, item: ItemDefinition) -> RuntimeResult<()> {
        self.check_id("item", &item.id)?;
        insert_unique(&self.items, "item", &self.plugin_id, item.id.clone(), item)
    }

    pub fn register_block(&self, block: BlockDefinition) -> RuntimeResult<()> {
        self.check_id("block", &block.id)?;
        insert_unique(&self.blocks, "block", &self.plugin_id, block.id.clone(), block)
    }

    pub fn register_recipe(&self, recipe: RecipeDefinition) -> RuntimeResult<()> {
        self.check_id("recipe", &recipe.id)?;
        if recipe.inputs.is_empty() {
            return Err(RuntimeError::InvalidRegistration(format!(
                "recipe '{}' in plugin '{}' has no inputs",
                recipe.id, self.plugin_id
            )));
        }
        insert_unique(&self.recipes, "recipe", &self.plugin_id, recipe.id.clone(), recipe)
    }

    pub fn register_system<F>(&self, system_id: &str, system: F) -> RuntimeResult<()>
    where
        F: Fn(u64) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.check_id("system", system_id)?;
        let registered = Arc::new(RegisteredSystem {
            run: Arc::new(system),
            health: Mutex::new(SystemHealth::default()),
            _module: self.module.clone(),
        });
        insert_unique(&self.systems, "system", &self.plugin_id, system_id.to_string(), registered)?;
        self.system_order.lock().push(system_id.to_string());
        Ok(())
    }

    pub fn item(&self, id: &str) -> Option<ItemDefinition> {
        self.items.get(id).map(|i| i.clone())
    }

    pub fn block(&self, id: &str) -> Option<BlockDefinition> {
        self.blocks.get(id).map(|b| b.clone())
    }

    pub fn recipe(&self, id: &str) -> Option<RecipeDefinition> {
        self.recipes.get(id).map(|r| r.clone())
    }

    pub fn item_ids(&self) -> Vec<String> {
        sorted_keys(&self.items)
    }

    pub fn block_ids(&self) -> Vec<String> {
        sorted_keys(&self.blocks)
    }

    pub fn recipe_ids(&self) -> Vec<String> {
        sorted_keys(&self.recipes)
    }

    /// System ids in registration order.
    pub fn system_ids(&self) -> Vec<String> {
        self.system_order.lock().clone()
    }

    pub fn summary(&self) -> RegistrySummary {
        RegistrySummary {
            items: self.items.len(),
            blocks: self.blocks.len(),
            recipes: self.recipes.len(),
            systems: self.systems.len(),
        }
    }

    /// Run every system that is not isolated. Failures are recorded as
    /// `system:<id>` faults.
    pub fn tick_systems(&self, tick: u64, metrics: &RuntimeMetrics, isolation: &SystemIsolationConfig) {
        for system_id in self.system_ids() {
            let Some(system) = self.systems.get(&system_id).map(|s| Arc::clone(&s)) else {
                continue;
            };
            if system.health.lock().skip_until_tick > tick {
                continue;
            }

            let started = Instant::now();
            let result = call_guarded(&format!("system '{system_id}'"), || (system.run)(tick));
            let elapsed = started.elapsed();
            metrics.record_system_run(&self.plugin_id, &system_id, elapsed, result.is_ok());

            let mut health = system.health.lock();
            match result {
                Ok(()) => {
                    health.consecutive_failures = 0;
                    health.isolation_level = 0;
                }
                Err(e) => {
                    health.consecutive_failures += 1;
                    metrics.record_fault(&self.plugin_id, &format!("system:{system_id}"));
                    warn!(
                        plugin = %self.plugin_id,
                        system = %system_id,
                        "System failed on tick {}: {:#}", tick, e
                    );
                    if health.consecutive_failures >= isolation.failure_threshold {
                        let cooldown = isolation.cooldown_for(health.isolation_level);
                        health.skip_until_tick = tick + cooldown + 1;
                        health.isolation_level = health.isolation_level.saturating_add(1);
                        health.consecutive_failures = 0;
                        warn!(
                            plugin = %self.plugin_id,
                            system = %system_id,
                            "System isolated for {} ticks", cooldown
                        );
                    }
                }
            }
        }
    }

    /// Systems skipped at `tick`.
    pub fn isolated_systems(&self, tick: u64) -> Vec<IsolatedSystem> {
        self.system_ids()
            .into_iter()
            .filter_map(|id| {
                let system = self.systems.get(&id)?;
                let health = *system.health.lock();
                (health.skip_until_tick > tick).then(|| IsolatedSystem {
                    id: id.clone(),
                    isolation_level: health.isolation_level,
                    resumes_at_tick: health.skip_until_tick,
                })
            })
            .collect()
    }

    pub fn clear(&self) {
        self.items.clear();
        self.blocks.clear();
        self.recipes.clear();
        self.systems.clear();
        self.system_order.lock().clear();
    }

    fn check_id(&self, kind: &str, id: &str) -> RuntimeResult<()> {
        if id.trim().is_empty() || id.chars().count() > MAX_ID_CHARS {
            return Err(RuntimeError::InvalidRegistration(format!(
                "{} id '{}' in plugin '{}' must be 1..={} characters",
                kind, id, self.plugin_id, MAX_ID_CHARS
            )));
        }
        Ok(())
    }
}

fn insert_unique<V>(
    map: &DashMap<String, V>,
    kind: &str,
    plugin_id: &str,
    id: String,
    value: V,
) -> RuntimeResult<()> {
    match map.entry(id) {
        Entry::Occupied(entry) => Err(RuntimeError::DuplicateRegistration(format!(
            "Duplicate {} id '{}' in plugin '{}'",
            kind,
            entry.key(),
            plugin_id
        ))),
        Entry::Vacant(entry) => {
            entry.insert(value);
            Ok(())
        }
    }
}

fn sorted_keys<V>(map: &DashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.iter().map(|e| e.key().clone()).collect();
    keys.sort();
    keys
}
