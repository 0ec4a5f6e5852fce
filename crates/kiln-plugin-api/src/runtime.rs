//! The plugin runtime: discovery, staging, lifecycle and the tick loop.
//!
//! A plugin moves through `Staging -> Enabled -> Disabling` and back out of
//! the loaded table. Everything it registers through its [`PluginContext`] is
//! torn down when it leaves, whether it leaves through `unload`, a failed
//! enable, or a reload.

use crate::adapter::{AdapterInvocation, AdapterResponse, AdapterSandbox};
use crate::commands::{CommandInvocation, CommandRegistry, CommandResult, PluginCommands};
use crate::config::RuntimeConfig;
use crate::context::{PluginContext, PluginLogger};
use crate::events::{EventBus, PluginDisabled, PluginEnabled, PluginEvents};
use crate::host::{HostAccess, ScopedHostAccess};
use crate::metrics::{FaultBudgetStage, PluginRuntimeProfile, RuntimeMetrics};
use crate::module::{ModuleGuard, ModuleLoader, PluginModule};
use crate::network::PluginNetworkHub;
use crate::plugin::{call_guarded, Plugin};
use crate::registry::PluginRegistry;
use crate::scheduler::PluginScheduler;
use crate::staging::PackageStager;
use crate::storage::StorageProvider;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kiln_runtime::resolver::{resolve, DependencyDiagnostic};
use kiln_runtime::version::{is_api_compatible, satisfies, RUNTIME_API_VERSION};
use kiln_runtime::{
    discover_in_directory, read_descriptor, ConfinedRoot, DependencyKind, PackageFingerprint,
    PluginDescriptor, PluginManifest, RuntimeError, RuntimeResult,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a plugin is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    Unloaded,
    Staging,
    Enabled,
    Disabling,
}

/// A plugin in the loaded table.
///
/// Field order matters: the instance is dropped before the module whose code
/// it runs.
pub struct LoadedPlugin {
    pub(crate) instance: Box<dyn Plugin>,
    pub(crate) module: Arc<dyn PluginModule>,
    pub manifest: Arc<PluginManifest>,
    pub context: PluginContext,
    pub source_path: PathBuf,
    pub staged_path: PathBuf,
    pub fingerprint: PackageFingerprint,
    pub loaded_at: DateTime<Utc>,
}

/// What is left of a plugin after it was unloaded; enough to bring it back.
#[derive(Debug, Clone)]
pub(crate) struct UnloadedRecord {
    pub manifest: Arc<PluginManifest>,
    pub source_path: PathBuf,
    pub staged_path: PathBuf,
    pub fingerprint: PackageFingerprint,
}

/// Snapshot of a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub source_path: PathBuf,
    pub staged_path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

/// Results of the most recent `scan_and_load`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub loaded: Vec<String>,
    pub rejected: BTreeMap<String, String>,
    pub version_mismatches: BTreeMap<String, String>,
    pub api_compatibility: BTreeMap<String, String>,
    pub diagnostics: BTreeMap<String, DependencyDiagnostic>,
    /// Packages that accepted resolution but failed to load.
    pub failed: BTreeMap<String, String>,
    /// Packages whose manifest could not be read.
    pub skipped: BTreeMap<String, String>,
}

/// Hosts plugins.
pub struct PluginRuntime {
    pub(crate) config: RuntimeConfig,
    pub(crate) data_root: ConfinedRoot,
    pub(crate) stager: PackageStager,
    loader: Arc<dyn ModuleLoader>,
    host: Arc<dyn HostAccess>,
    pub(crate) metrics: Arc<RuntimeMetrics>,
    commands: Arc<CommandRegistry>,
    events: Arc<EventBus>,
    network: Arc<PluginNetworkHub>,
    pub(crate) loaded: DashMap<String, LoadedPlugin>,
    states: DashMap<String, PluginState>,
    /// Ids between `open` and their slot in `loaded`.
    activating: Mutex<HashSet<String>>,
    pub(crate) load_order: Mutex<Vec<String>>,
    tick: AtomicU64,
    pub(crate) reload_in_flight: AtomicBool,
    pub(crate) last_scan: Mutex<ScanReport>,
}

/// Exclusive right to activate one plugin id. Released on drop.
struct ActivationClaim<'a> {
    claims: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> ActivationClaim<'a> {
    fn take(claims: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        claims.lock().insert(id.to_string()).then(|| Self {
            claims,
            id: id.to_string(),
        })
    }
}

impl Drop for ActivationClaim<'_> {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.id);
    }
}

impl PluginRuntime {
    pub fn new(
        config: RuntimeConfig,
        loader: Arc<dyn ModuleLoader>,
        host: Arc<dyn HostAccess>,
    ) -> RuntimeResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.plugins_dir)?;
        let data_root = ConfinedRoot::new(&config.data_dir)?;
        let stager = PackageStager::new(&config.plugins_dir, data_root.clone(), config.max_package_bytes);
        let metrics = Arc::new(RuntimeMetrics::new(config.metrics.clone(), config.fault_budget.clone()));

        info!(
            plugins_dir = %config.plugins_dir.display(),
            data_dir = %data_root.path().display(),
            api_version = RUNTIME_API_VERSION,
            "Plugin runtime initialized"
        );

        Ok(Self {
            config,
            data_root,
            stager,
            loader,
            host,
            metrics,
            commands: Arc::new(CommandRegistry::new()),
            events: Arc::new(EventBus::new()),
            network: Arc::new(PluginNetworkHub::new()),
            loaded: DashMap::new(),
            states: DashMap::new(),
            activating: Mutex::new(HashSet::new()),
            load_order: Mutex::new(Vec::new()),
            tick: AtomicU64::new(0),
            reload_in_flight: AtomicBool::new(false),
            last_scan: Mutex::new(ScanReport::default()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn network(&self) -> &Arc<PluginNetworkHub> {
        &self.network
    }

    /// Root of everything the runtime writes.
    pub fn data_root(&self) -> &Path {
        self.data_root.path()
    }

    /// Discover packages in the plugins directory and load every plugin that
    /// resolves. Returns the ids loaded by this call, in load order.
    pub fn scan_and_load(&self) -> RuntimeResult<Vec<String>> {
        let exclude: HashSet<String> = self.loaded.iter().map(|e| e.key().clone()).collect();
        let discovery = discover_in_directory(&self.config.plugins_dir, &exclude)?;

        let mut report = ScanReport::default();
        for skipped in &discovery.skipped {
            warn!(package = %skipped.path.display(), "Skipping package: {}", skipped.reason);
            report
                .skipped
                .insert(skipped.path.display().to_string(), skipped.reason.clone());
        }

        let resolution = resolve(&discovery.descriptors, &self.loaded_versions());
        for (id, reason) in &resolution.rejected {
            warn!(plugin = %id, "Plugin rejected: {}", reason);
        }

        let mut failed: HashSet<String> = HashSet::new();
        for descriptor in &resolution.ordered {
            let id = descriptor.id().to_string();
            let blocked = descriptor
                .manifest
                .required_ids()
                .into_iter()
                .find(|dep| failed.contains(dep));
            if let Some(dep) = blocked {
                let reason = format!("required dependency '{dep}' failed to load");
                warn!(plugin = %id, "Skipping plugin: {}", reason);
                report.failed.insert(id.clone(), reason);
                failed.insert(id);
                continue;
            }

            match self.load_descriptor(descriptor) {
                Ok(()) => report.loaded.push(id),
                Err(e) => {
                    warn!(plugin = %id, "Failed to load plugin: {}", e);
                    report.failed.insert(id.clone(), e.to_string());
                    failed.insert(id);
                }
            }
        }

        report.rejected = resolution.rejected;
        report.version_mismatches = resolution.version_mismatches;
        report.api_compatibility = resolution.api_compatibility;
        report.diagnostics = resolution.diagnostics;

        info!(
            loaded = report.loaded.len(),
            rejected = report.rejected.len(),
            failed = report.failed.len(),
            "Plugin scan complete"
        );
        let loaded = report.loaded.clone();
        *self.last_scan.lock() = report;
        Ok(loaded)
    }

    /// The report of the most recent scan.
    pub fn last_scan(&self) -> ScanReport {
        self.last_scan.lock().clone()
    }

    /// Load one package. Its dependencies must already be loaded.
    pub fn load_package(&self, path: &Path) -> RuntimeResult<String> {
        let descriptor = read_descriptor(path)?;
        if self.loaded.contains_key(descriptor.id()) {
            return Err(RuntimeError::AlreadyLoaded(descriptor.id().to_string()));
        }
        self.check_against_loaded(&descriptor.manifest)?;
        self.load_descriptor(&descriptor)?;
        Ok(descriptor.id().to_string())
    }

    fn check_against_loaded(&self, manifest: &PluginManifest) -> RuntimeResult<()> {
        if !is_api_compatible(&manifest.api_version) {
            return Err(RuntimeError::IncompatibleApi(format!(
                "{} targets API {}, runtime provides {}",
                manifest.id, manifest.api_version, RUNTIME_API_VERSION
            )));
        }

        let versions = self.loaded_versions();
        for dep in &manifest.dependencies {
            let present = versions.get(&dep.id);
            let in_range = present.is_some_and(|v| satisfies(v, dep.version.as_deref()));
            match dep.kind {
                DependencyKind::Required => match present {
                    None => {
                        return Err(RuntimeError::Dependency(format!(
                            "{} requires '{}', which is not loaded",
                            manifest.id, dep.id
                        )))
                    }
                    Some(found) if !in_range => {
                        return Err(RuntimeError::Dependency(format!(
                            "Dependency version mismatch: {} requires '{} {}', found '{}'",
                            manifest.id,
                            dep.id,
                            dep.version.as_deref().unwrap_or("*"),
                            found
                        )))
                    }
                    Some(_) => {}
                },
                DependencyKind::Optional => {
                    if let Some(found) = present.filter(|_| !in_range) {
                        return Err(RuntimeError::Dependency(format!(
                            "Dependency version mismatch: {} optionally requires '{} {}', found '{}'",
                            manifest.id,
                            dep.id,
                            dep.version.as_deref().unwrap_or("*"),
                            found
                        )));
                    }
                }
                DependencyKind::Conflicts => {
                    if in_range {
                        return Err(RuntimeError::Dependency(format!(
                            "{} conflicts with loaded plugin '{}'",
                            manifest.id, dep.id
                        )));
                    }
                }
                DependencyKind::SoftAfter => {}
            }
        }

        for entry in self.loaded.iter() {
            let conflicting = entry
                .manifest
                .dependencies_of(DependencyKind::Conflicts)
                .any(|d| d.id == manifest.id && satisfies(&manifest.version, d.version.as_deref()));
            if conflicting {
                return Err(RuntimeError::Dependency(format!(
                    "loaded plugin '{}' conflicts with {}",
                    entry.key(),
                    manifest.id
                )));
            }
        }
        Ok(())
    }

    /// Stage and enable a descriptor that already passed resolution.
    pub(crate) fn load_descriptor(&self, descriptor: &PluginDescriptor) -> RuntimeResult<()> {
        let id = descriptor.id();
        if self.loaded.contains_key(id) {
            return Err(RuntimeError::AlreadyLoaded(id.to_string()));
        }

        self.states.insert(id.to_string(), PluginState::Staging);
        let staged = PackageFingerprint::of(&descriptor.package_path)
            .and_then(|fingerprint| Ok((fingerprint, self.stager.stage(id, &descriptor.package_path)?)));
        let (fingerprint, staged_path) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                self.states.remove(id);
                return Err(e);
            }
        };

        let record = UnloadedRecord {
            manifest: Arc::new(descriptor.manifest.clone()),
            source_path: descriptor.package_path.clone(),
            staged_path: staged_path.clone(),
            fingerprint,
        };
        if let Err(e) = self.activate(record) {
            if let Err(discard) = self.stager.discard(&staged_path) {
                warn!(plugin = %id, "Failed to discard staged package: {}", discard);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Open the staged module, create the instance and enable it.
    pub(crate) fn activate(&self, record: UnloadedRecord) -> RuntimeResult<()> {
        let manifest = record.manifest;
        let id = manifest.id.clone();
        // Claim the id before checking `loaded`: a racing load either sees
        // the claim or the finished entry, and never runs its `on_enable`.
        let Some(_claim) = ActivationClaim::take(&self.activating, &id).filter(|_| !self.loaded.contains_key(&id))
        else {
            if self.loaded.contains_key(&id) {
                self.states.insert(id.clone(), PluginState::Enabled);
            }
            return Err(RuntimeError::AlreadyLoaded(id));
        };
        self.states.insert(id.clone(), PluginState::Staging);

        let prepared = self
            .loader
            .open(&record.staged_path, &manifest)
            .map(Arc::<dyn PluginModule>::from)
            .and_then(|module| {
                let instance = module.instantiate(&manifest.main)?;
                Ok((module, instance))
            })
            .and_then(|(module, instance)| {
                let guard = ModuleGuard::new(Arc::clone(&module));
                Ok((module, instance, self.build_context(&manifest, guard)?))
            });
        let (module, mut instance, context) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.states.remove(&id);
                return Err(e);
            }
        };

        let enabled = call_guarded(&format!("plugin '{id}' on_enable"), || instance.on_enable(&context));
        if let Err(e) = enabled {
            self.teardown(&context);
            drop(instance);
            drop(module);
            self.states.remove(&id);
            return Err(RuntimeError::InitializationFailed(format!("{id}: {e:#}")));
        }

        let loaded = LoadedPlugin {
            instance,
            module,
            manifest: Arc::clone(&manifest),
            context,
            source_path: record.source_path,
            staged_path: record.staged_path,
            fingerprint: record.fingerprint,
            loaded_at: Utc::now(),
        };
        let rejected = match self.loaded.entry(id.clone()) {
            Entry::Occupied(_) => Some(loaded),
            Entry::Vacant(slot) => {
                slot.insert(loaded);
                None
            }
        };
        if let Some(LoadedPlugin {
            mut instance,
            module,
            context,
            ..
        }) = rejected
        {
            // The claim keeps other loads of this id out, so everything
            // registered under it belongs to this instance.
            if let Err(e) = call_guarded(&format!("plugin '{id}' on_disable"), || instance.on_disable(&context)) {
                warn!(plugin = %id, "Plugin disable failed: {:#}", e);
            }
            self.teardown(&context);
            drop(instance);
            drop(module);
            return Err(RuntimeError::AlreadyLoaded(id));
        }

        self.load_order.lock().push(id.clone());
        self.states.insert(id.clone(), PluginState::Enabled);
        info!(plugin = %id, version = %manifest.version, "Plugin enabled");
        self.events.publish(&PluginEnabled {
            id,
            version: manifest.version.clone(),
        });
        Ok(())
    }

    /// Context for one load. Every registration made through it pins `module`.
    fn build_context(&self, manifest: &Arc<PluginManifest>, module: ModuleGuard) -> RuntimeResult<PluginContext> {
        let id = manifest.id.as_str();
        let storage_root = self.plugin_data_dir(id)?;
        std::fs::create_dir_all(&storage_root)?;

        Ok(PluginContext {
            manifest: Arc::clone(manifest),
            logger: PluginLogger::new(id),
            scheduler: Arc::new(
                PluginScheduler::new(id, self.config.scheduler.max_tasks_per_plugin).with_module(module.clone()),
            ),
            registry: Arc::new(PluginRegistry::new(id).with_module(module.clone())),
            adapters: Arc::new(
                AdapterSandbox::new(id, self.config.adapters.clone(), Arc::clone(&self.metrics))
                    .with_module(module.clone()),
            ),
            storage: StorageProvider::new(id, storage_root),
            commands: PluginCommands::new(id, Arc::clone(&self.commands)).with_module(module.clone()),
            events: PluginEvents::new(id, Arc::clone(&self.events)).with_module(module.clone()),
            host: Arc::new(ScopedHostAccess::new(
                id,
                manifest.permission_set(),
                Arc::clone(&self.host),
            )),
            network: self.network.view_for(id).with_module(module),
        })
    }

    /// A plugin's storage directory.
    pub fn plugin_data_dir(&self, plugin_id: &str) -> RuntimeResult<PathBuf> {
        self.data_root.join(["plugins", plugin_id])
    }

    /// Remove everything a plugin registered through its context.
    fn teardown(&self, context: &PluginContext) {
        let id = context.plugin_id();
        context.scheduler.clear();
        context.registry.clear();
        context.adapters.close();
        let commands = self.commands.remove_plugin(id);
        self.events.remove_plugin(id);
        self.network.remove_plugin(id);
        self.metrics.clear_plugin(id);
        debug!(plugin = %id, commands, "Plugin registrations removed");
    }

    /// Unload a plugin. Returns whether it was loaded.
    pub fn unload(&self, plugin_id: &str) -> bool {
        self.unload_internal(plugin_id, true).is_some()
    }

    pub(crate) fn unload_internal(&self, plugin_id: &str, delete_staged: bool) -> Option<UnloadedRecord> {
        let (_, loaded) = self.loaded.remove(plugin_id)?;
        self.load_order.lock().retain(|id| id != plugin_id);
        self.states.insert(plugin_id.to_string(), PluginState::Disabling);

        let LoadedPlugin {
            mut instance,
            module,
            manifest,
            context,
            source_path,
            staged_path,
            fingerprint,
            ..
        } = loaded;

        if let Err(e) = call_guarded(&format!("plugin '{plugin_id}' on_disable"), || instance.on_disable(&context)) {
            warn!(plugin = %plugin_id, "Plugin disable failed: {:#}", e);
        }
        self.teardown(&context);
        drop(instance);
        drop(module);

        if delete_staged {
            if let Err(e) = self.stager.discard(&staged_path) {
                warn!(plugin = %plugin_id, "Failed to discard staged package: {}", e);
            }
        }

        self.states.remove(plugin_id);
        info!(plugin = %plugin_id, version = %manifest.version, "Plugin unloaded");
        self.events.publish(&PluginDisabled {
            id: plugin_id.to_string(),
        });

        Some(UnloadedRecord {
            manifest,
            source_path,
            staged_path,
            fingerprint,
        })
    }

    /// Unload every plugin, dependents first.
    pub fn shutdown(&self) {
        let order = self.loaded_plugin_ids();
        for id in order.iter().rev() {
            self.unload(id);
        }
        info!(unloaded = order.len(), "Plugin runtime shut down");
    }

    /// Advance one tick: run due tasks, then systems, plugin by plugin in
    /// load order. Returns the new tick number.
    pub fn tick(&self) -> u64 {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        let targets: Vec<(String, Arc<PluginScheduler>, Arc<PluginRegistry>)> = self
            .loaded_plugin_ids()
            .into_iter()
            .filter_map(|id| {
                let loaded = self.loaded.get(&id)?;
                Some((
                    id.clone(),
                    Arc::clone(&loaded.context.scheduler),
                    Arc::clone(&loaded.context.registry),
                ))
            })
            .collect();

        for (id, scheduler, registry) in targets {
            for run in scheduler.run_due(tick) {
                if let Err(e) = &run.result {
                    warn!(plugin = %id, task = %run.task_id, "Task failed: {:#}", e);
                    self.metrics.record_fault(&id, &format!("task:{}", run.task_id));
                }
            }
            registry.tick_systems(tick, &self.metrics, &self.config.isolation);
        }
        tick
    }

    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Invoke an adapter of a loaded plugin.
    pub async fn invoke_adapter(
        &self,
        plugin_id: &str,
        adapter_id: &str,
        invocation: AdapterInvocation,
    ) -> AdapterResponse {
        let sandbox = match self.loaded.get(plugin_id) {
            Some(loaded) => Arc::clone(&loaded.context.adapters),
            None => return AdapterResponse::denied(format!("Plugin '{plugin_id}' is not loaded")),
        };
        sandbox.invoke(adapter_id, invocation).await
    }

    /// Run a command registered by any loaded plugin.
    pub fn execute_command(&self, name: &str, sender: &str, args: &[&str]) -> CommandResult {
        let invocation = CommandInvocation {
            sender: sender.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        let execution = self.commands.execute(name, &invocation);
        if execution.faulted {
            if let Some(owner) = &execution.owner {
                self.metrics.record_fault(
                    owner,
                    &format!("command:{}", name.trim().to_ascii_lowercase()),
                );
            }
        }
        execution.result
    }

    /// Loaded ids in load order.
    pub fn loaded_plugin_ids(&self) -> Vec<String> {
        self.load_order.lock().clone()
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.loaded.contains_key(plugin_id)
    }

    pub fn manifest(&self, plugin_id: &str) -> Option<Arc<PluginManifest>> {
        self.loaded.get(plugin_id).map(|l| Arc::clone(&l.manifest))
    }

    pub fn plugin_context(&self, plugin_id: &str) -> Option<PluginContext> {
        self.loaded.get(plugin_id).map(|l| l.context.clone())
    }

    pub fn loaded_info(&self, plugin_id: &str) -> Option<LoadedInfo> {
        self.loaded.get(plugin_id).map(|l| LoadedInfo {
            id: l.manifest.id.clone(),
            name: l.manifest.name.clone(),
            version: l.manifest.version.clone(),
            source_path: l.source_path.clone(),
            staged_path: l.staged_path.clone(),
            loaded_at: l.loaded_at,
        })
    }

    pub fn plugin_state(&self, plugin_id: &str) -> PluginState {
        self.states
            .get(plugin_id)
            .map(|s| *s)
            .unwrap_or(PluginState::Unloaded)
    }

    pub fn profile(&self, plugin_id: &str) -> Option<PluginRuntimeProfile> {
        self.metrics.profile(plugin_id)
    }

    pub fn fault_stage(&self, plugin_id: &str) -> FaultBudgetStage {
        self.metrics.fault_stage(plugin_id)
    }

    /// Versions of every loaded plugin.
    pub fn loaded_versions(&self) -> HashMap<String, String> {
        self.loaded
            .iter()
            .map(|e| (e.key().clone(), e.manifest.version.clone()))
            .collect()
    }
}

impl Drop for PluginRuntime {
    fn drop(&mut self) {
        if !self.loaded.is_empty() {
            self.shutdown();
        }
    }
}
