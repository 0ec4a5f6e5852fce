//! Everything a plugin can reach, handed to it on enable and disable.

use crate::adapter::AdapterSandbox;
use crate::commands::PluginCommands;
use crate::events::PluginEvents;
use crate::host::ScopedHostAccess;
use crate::network::PluginNetwork;
use crate::registry::PluginRegistry;
use crate::scheduler::PluginScheduler;
use crate::storage::StorageProvider;
use kiln_runtime::PluginManifest;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Logs through `tracing` with the owning plugin attached.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: String,
}

impl PluginLogger {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
        }
    }

    pub fn debug(&self, message: &str) {
        debug!(target: "kiln::plugin", plugin = %self.plugin_id, "{}", message);
    }

    pub fn info(&self, message: &str) {
        info!(target: "kiln::plugin", plugin = %self.plugin_id, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        warn!(target: "kiln::plugin", plugin = %self.plugin_id, "{}", message);
    }

    pub fn error(&self, message: &str) {
        error!(target: "kiln::plugin", plugin = %self.plugin_id, "{}", message);
    }
}

/// A plugin's view of the runtime.
///
/// Every handle is scoped to the plugin: registrations are tagged with its id
/// so the runtime can remove them on unload, and host calls are checked
/// against the permissions in its manifest.
#[derive(Clone)]
pub struct PluginContext {
    pub manifest: Arc<PluginManifest>,
    pub logger: PluginLogger,
    pub scheduler: Arc<PluginScheduler>,
    pub registry: Arc<PluginRegistry>,
    pub adapters: Arc<AdapterSandbox>,
    pub storage: StorageProvider,
    pub commands: PluginCommands,
    pub events: PluginEvents,
    pub host: Arc<ScopedHostAccess>,
    pub network: PluginNetwork,
}

impl PluginContext {
    pub fn plugin_id(&self) -> &str {
        &self.manifest.id
    }
}
