//! Transactional hot reload.
//!
//! A reload covers the target plus everything that depends on it. The set is
//! re-read from disk and resolved against the rest of the runtime before
//! anything is touched, the plugins' data directories are checkpointed, and
//! then the set is unloaded dependents-first and loaded back in dependency
//! order. If any load fails, the new instances are unloaded, the data is
//! restored and the previous instances are brought back from the artifacts
//! they were staged from.

use crate::runtime::{PluginRuntime, UnloadedRecord};
use kiln_runtime::paths::digest_dir;
use kiln_runtime::resolver::resolve;
use kiln_runtime::{read_descriptor, DependencyKind, PackageFingerprint, PluginDescriptor, RuntimeResult};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReloadStatus {
    Success,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    /// Plugin id, or `*` for a full reload.
    pub target: String,
    /// The reload set, in load order.
    pub affected_plugins: Vec<String>,
    /// Plugins running new instances afterwards.
    pub reloaded_plugins: Vec<String>,
    pub status: ReloadStatus,
    pub reason: Option<String>,
    /// Plugins whose data changed between checkpoint and rollback.
    pub checkpoint_changed_plugins: Vec<String>,
    pub rollback_recovered_plugins: Vec<String>,
    pub rollback_failed_plugins: Vec<String>,
    pub rollback_data_restored: bool,
}

impl ReloadReport {
    fn new(target: &str, affected: Vec<String>) -> Self {
        Self {
            target: target.to_string(),
            affected_plugins: affected,
            reloaded_plugins: Vec::new(),
            status: ReloadStatus::Failed,
            reason: None,
            checkpoint_changed_plugins: Vec::new(),
            rollback_recovered_plugins: Vec::new(),
            rollback_failed_plugins: Vec::new(),
            rollback_data_restored: false,
        }
    }

    fn failed(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(reload = %self.target, "Reload failed: {}", reason);
        self.status = ReloadStatus::Failed;
        self.reason = Some(reason);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ReloadStatus::Success
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Copies of the reload set's data directories.
struct Checkpoint {
    dir: PathBuf,
    digests: BTreeMap<String, String>,
}

impl PluginRuntime {
    pub fn reload(&self, plugin_id: &str) -> ReloadStatus {
        self.reload_with_report(plugin_id).status
    }

    pub fn reload_all(&self) -> ReloadStatus {
        self.reload_all_with_report().status
    }

    /// Reload a plugin and everything that depends on it.
    pub fn reload_with_report(&self, plugin_id: &str) -> ReloadReport {
        if !self.is_loaded(plugin_id) {
            return ReloadReport::new(plugin_id, Vec::new())
                .failed(format!("Plugin '{plugin_id}' is not loaded"));
        }
        self.transaction(plugin_id, &[plugin_id.to_string()])
    }

    /// Reload every loaded plugin as one transaction.
    pub fn reload_all_with_report(&self) -> ReloadReport {
        let roots = self.loaded_plugin_ids();
        if roots.is_empty() {
            let mut report = ReloadReport::new("*", Vec::new());
            report.status = ReloadStatus::Success;
            return report;
        }
        self.transaction("*", &roots)
    }

    /// Reload plugins whose package changed on disk since they were loaded.
    /// One report per changed root, where a root is a changed plugin that is
    /// not itself in the reload set of another changed plugin.
    pub fn reload_changed_with_report(&self) -> Vec<ReloadReport> {
        let changed: Vec<String> = self
            .loaded_plugin_ids()
            .into_iter()
            .filter(|id| {
                let Some(loaded) = self.loaded.get(id) else {
                    return false;
                };
                match PackageFingerprint::of(&loaded.source_path) {
                    Ok(current) => current != loaded.fingerprint,
                    Err(e) => {
                        warn!(plugin = %id, "Cannot check package {}: {}", loaded.source_path.display(), e);
                        false
                    }
                }
            })
            .collect();

        let covered: HashSet<String> = changed
            .iter()
            .flat_map(|id| {
                self.reload_closure(std::slice::from_ref(id))
                    .into_iter()
                    .filter(move |member| member != id)
            })
            .collect();

        changed
            .iter()
            .filter(|id| !covered.contains(*id))
            .map(|root| {
                info!(plugin = %root, "Package changed on disk, reloading");
                self.reload_with_report(root)
            })
            .collect()
    }

    /// `roots` plus every loaded plugin depending on them, in load order.
    pub fn reload_closure(&self, roots: &[String]) -> Vec<String> {
        let loaded = self.loaded_versions();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for entry in self.loaded.iter() {
            for dep in &entry.manifest.dependencies {
                let edge = match dep.kind {
                    DependencyKind::Required => true,
                    DependencyKind::Optional => loaded.contains_key(&dep.id),
                    DependencyKind::SoftAfter | DependencyKind::Conflicts => false,
                };
                if edge {
                    dependents
                        .entry(dep.id.clone())
                        .or_default()
                        .push(entry.key().clone());
                }
            }
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = roots.iter().cloned().collect();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if let Some(next) = dependents.get(&id) {
                queue.extend(next.iter().filter(|n| !visited.contains(*n)).cloned());
            }
        }

        self.loaded_plugin_ids()
            .into_iter()
            .filter(|id| visited.contains(id))
            .collect()
    }

    fn transaction(&self, target: &str, roots: &[String]) -> ReloadReport {
        if self
            .reload_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ReloadReport::new(target, Vec::new()).failed("reload already in progress");
        }
        let _in_flight = InFlight(&self.reload_in_flight);

        let affected = self.reload_closure(roots);
        let report = ReloadReport::new(target, affected.clone());

        let mut descriptors: Vec<PluginDescriptor> = Vec::with_capacity(affected.len());
        for id in &affected {
            let Some(source) = self.loaded.get(id).map(|l| l.source_path.clone()) else {
                return report.failed(format!("Plugin '{id}' was unloaded during reload"));
            };
            match read_descriptor(&source) {
                Ok(descriptor) if descriptor.id() == id => descriptors.push(descriptor),
                Ok(descriptor) => {
                    return report.failed(format!(
                        "Package {} now declares '{}' instead of '{}'",
                        source.display(),
                        descriptor.id(),
                        id
                    ))
                }
                Err(e) => return report.failed(format!("Failed to read manifest for '{id}': {e}")),
            }
        }

        let mut external = self.loaded_versions();
        external.retain(|id, _| !affected.contains(id));
        let resolution = resolve(&descriptors, &external);
        if !resolution.rejected.is_empty() {
            let reasons: Vec<String> = resolution
                .rejected
                .iter()
                .map(|(id, reason)| format!("{id}: {reason}"))
                .collect();
            return report.failed(format!("Reload rejected: {}", reasons.join("; ")));
        }

        let checkpoint = match self.checkpoint(&affected) {
            Ok(checkpoint) => checkpoint,
            Err(e) => return report.failed(format!("Checkpoint failed: {e}")),
        };

        let mut previous: Vec<UnloadedRecord> = affected
            .iter()
            .rev()
            .filter_map(|id| self.unload_internal(id, false))
            .collect();
        previous.reverse();

        let mut report = report;
        let mut failure = None;
        for descriptor in &resolution.ordered {
            match self.load_descriptor(descriptor) {
                Ok(()) => report.reloaded_plugins.push(descriptor.id().to_string()),
                Err(e) => {
                    failure = Some(format!("{}: {}", descriptor.id(), e));
                    break;
                }
            }
        }

        match failure {
            None => {
                for record in &previous {
                    if let Err(e) = self.stager.discard(&record.staged_path) {
                        warn!(plugin = %record.manifest.id, "Failed to discard previous package: {}", e);
                    }
                }
                self.discard_checkpoint(&checkpoint);
                info!(reload = %target, plugins = ?report.reloaded_plugins, "Reload complete");
                report.status = ReloadStatus::Success;
                report
            }
            Some(reason) => self.roll_back(report, reason, previous, checkpoint),
        }
    }

    fn roll_back(
        &self,
        mut report: ReloadReport,
        reason: String,
        previous: Vec<UnloadedRecord>,
        checkpoint: Checkpoint,
    ) -> ReloadReport {
        warn!(reload = %report.target, "Reload failed, rolling back: {}", reason);

        for id in report.reloaded_plugins.iter().rev() {
            self.unload_internal(id, true);
        }
        report.reloaded_plugins.clear();

        report.checkpoint_changed_plugins = checkpoint
            .digests
            .iter()
            .filter(|(id, digest)| {
                self.plugin_data_dir(id)
                    .and_then(|dir| digest_dir(&dir))
                    .map(|current| &current != *digest)
                    .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut errors = Vec::new();
        match self.restore_checkpoint(&checkpoint) {
            Ok(()) => report.rollback_data_restored = true,
            Err(e) => errors.push(format!("data restore: {e}")),
        }

        for record in previous {
            let id = record.manifest.id.clone();
            match self.activate(record) {
                Ok(()) => report.rollback_recovered_plugins.push(id),
                Err(e) => {
                    errors.push(format!("{id}: {e}"));
                    report.rollback_failed_plugins.push(id);
                }
            }
        }

        if errors.is_empty() {
            self.discard_checkpoint(&checkpoint);
            report.status = ReloadStatus::RolledBack;
            report.reason = Some(reason);
        } else {
            let combined = format!("Reload failed: {}; rollback failed: {}", reason, errors.join("; "));
            error!(
                reload = %report.target,
                checkpoint = %checkpoint.dir.display(),
                "{}; manual intervention required",
                combined
            );
            report.status = ReloadStatus::Failed;
            report.reason = Some(combined);
        }
        report
    }

    fn checkpoint(&self, plugin_ids: &[String]) -> RuntimeResult<Checkpoint> {
        let name = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.data_root.join(["checkpoints", name.as_str()])?;
        let mut checkpoint = Checkpoint {
            dir,
            digests: BTreeMap::new(),
        };

        let copied: RuntimeResult<()> = plugin_ids.iter().try_for_each(|id| {
            let source = self.plugin_data_dir(id)?;
            let target = self.data_root.join(["checkpoints", name.as_str(), id.as_str()])?;
            self.data_root.copy_dir(&source, &target)?;
            checkpoint.digests.insert(id.clone(), digest_dir(&source)?);
            Ok(())
        });
        if let Err(e) = copied {
            self.discard_checkpoint(&checkpoint);
            return Err(e);
        }
        Ok(checkpoint)
    }

    fn restore_checkpoint(&self, checkpoint: &Checkpoint) -> RuntimeResult<()> {
        for id in checkpoint.digests.keys() {
            let saved = checkpoint.dir.join(id);
            self.data_root.replace_dir(&saved, &self.plugin_data_dir(id)?)?;
        }
        Ok(())
    }

    fn discard_checkpoint(&self, checkpoint: &Checkpoint) {
        if let Err(e) = self.data_root.remove_dir(&checkpoint.dir) {
            warn!(checkpoint = %checkpoint.dir.display(), "Failed to remove checkpoint: {}", e);
        }
    }
}
