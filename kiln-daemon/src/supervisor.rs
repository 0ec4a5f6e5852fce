//! Background loops that keep a [`PluginRuntime`] running.
//!
//! The `Supervisor` owns two tokio tasks:
//!
//! - the tick loop, which advances the runtime every `tick_interval_millis`
//!   on the blocking pool and quarantines plugins whose fault budget reached
//!   ISOLATE
//! - the reload watcher, which reloads plugins whose package changed on disk
//!
//! Both stop when [`Supervisor::shutdown`] is called.

use crate::config::DaemonConfig;
use anyhow::Result;
use kiln_plugin_api::{FaultBudgetStage, PluginRuntime, ReloadStatus};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct Supervisor {
    runtime: Arc<PluginRuntime>,
    settings: DaemonConfig,
    quarantined: Arc<Mutex<BTreeSet<String>>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(runtime: Arc<PluginRuntime>, settings: DaemonConfig) -> Self {
        Self {
            runtime,
            settings,
            quarantined: Arc::new(Mutex::new(BTreeSet::new())),
            shutdown_tx: None,
            handles: Vec::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<PluginRuntime> {
        &self.runtime
    }

    /// Plugins unloaded because their fault budget was exhausted.
    pub fn quarantined(&self) -> Vec<String> {
        self.quarantined.lock().iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Spawn the tick loop and, unless disabled, the reload watcher.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            anyhow::bail!("Supervisor already started");
        }
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        self.handles.push(self.spawn_tick_loop(shutdown_tx.subscribe()));
        if self.settings.reload_poll_seconds > 0 {
            self.handles.push(self.spawn_reload_watcher(shutdown_tx.subscribe()));
        } else {
            info!("Hot reload disabled");
        }

        self.shutdown_tx = Some(shutdown_tx);
        info!(
            tick_millis = self.settings.tick_interval_millis,
            reload_poll_seconds = self.settings.reload_poll_seconds,
            "Supervisor started"
        );
        Ok(())
    }

    /// Stop both loops and wait for them to finish.
    pub async fn shutdown(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = shutdown_tx.send(());

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("Supervisor task ended abnormally: {}", e);
            }
        }
        info!("Supervisor stopped");
    }

    fn spawn_tick_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let runtime = Arc::clone(&self.runtime);
        let quarantined = Arc::clone(&self.quarantined);
        let quarantine = self.settings.quarantine_on_isolate;
        let period = Duration::from_millis(self.settings.tick_interval_millis);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Plugin code runs synchronously; keep it off the async workers.
                        let runtime = Arc::clone(&runtime);
                        let quarantined = Arc::clone(&quarantined);
                        let pass = tokio::task::spawn_blocking(move || {
                            runtime.tick();
                            if quarantine {
                                quarantine_isolated(&runtime, &quarantined);
                            }
                        });
                        if let Err(e) = pass.await {
                            error!("Tick failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Tick loop stopping");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_reload_watcher(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let runtime = Arc::clone(&self.runtime);
        let period = Duration::from_secs(self.settings.reload_poll_seconds);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; nothing has changed yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let runtime = Arc::clone(&runtime);
                        match tokio::task::spawn_blocking(move || runtime.reload_changed_with_report()).await {
                            Ok(reports) => {
                                for report in reports {
                                    match report.status {
                                        ReloadStatus::Success => info!(
                                            reload = %report.target,
                                            plugins = ?report.reloaded_plugins,
                                            "Hot reload applied"
                                        ),
                                        ReloadStatus::RolledBack => warn!(
                                            reload = %report.target,
                                            "Hot reload rolled back: {}",
                                            report.reason.unwrap_or_default()
                                        ),
                                        ReloadStatus::Failed => error!(
                                            reload = %report.target,
                                            "Hot reload failed: {}",
                                            report.reason.unwrap_or_default()
                                        ),
                                    }
                                }
                            }
                            Err(e) => error!("Reload check panicked: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Reload watcher stopping");
                        break;
                    }
                }
            }
        })
    }
}

/// Unload every plugin whose fault budget reached ISOLATE, together with the
/// plugins that depend on it. Returns the ids unloaded, dependents first.
pub fn quarantine_isolated(runtime: &PluginRuntime, quarantined: &Mutex<BTreeSet<String>>) -> Vec<String> {
    let isolated: Vec<String> = runtime
        .loaded_plugin_ids()
        .into_iter()
        .filter(|id| runtime.fault_stage(id) == FaultBudgetStage::Isolate)
        .collect();
    if isolated.is_empty() {
        return Vec::new();
    }

    let mut unloaded = Vec::new();
    for id in runtime.reload_closure(&isolated).iter().rev() {
        if runtime.unload(id) {
            if isolated.contains(id) {
                warn!(plugin = %id, "Fault budget exhausted, plugin quarantined");
            } else {
                warn!(plugin = %id, "Unloaded because a dependency was quarantined");
            }
            quarantined.lock().insert(id.clone());
            unloaded.push(id.clone());
        }
    }
    unloaded
}
