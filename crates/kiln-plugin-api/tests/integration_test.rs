//! Integration tests for the kiln-plugin-api runtime.
//!
//! These tests cover:
//! - Scanning, dependency ordering and rejection
//! - Loading, unloading and enable failures
//! - Transactional reload, rollback and the double-failure state
//! - Permission-scoped host access
//! - Adapter rate limits and timeouts through the runtime
//! - Module lifetime against code still running after unload
//! - Duplicate registrations, tick systems and diagnostics

use async_trait::async_trait;
use kiln_plugin_api::adapter::{AdapterPayload, REQUIRED_CAPABILITY_KEY};
use kiln_plugin_api::host::{HostAccess, ScopedHostAccess};
use kiln_plugin_api::{
    AdapterInvocation, AdapterOutcome, FnAdapter, InProcessModuleLoader, ItemDefinition, ModAdapter,
    ModuleLoader, Plugin, PluginContext, PluginEnabled, PluginModule, PluginRuntime, ReloadStatus,
    RuntimeConfig, StandaloneHost,
};
use kiln_runtime::{PackageBuilder, PluginManifest, RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

type EnableFn = Arc<dyn Fn(&PluginContext) -> anyhow::Result<()> + Send + Sync>;

/// A plugin whose `on_enable` is a closure. Counts live instances.
struct TestPlugin {
    on_enable: EnableFn,
    live: Arc<AtomicUsize>,
}

impl TestPlugin {
    fn new(on_enable: EnableFn, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { on_enable, live }
    }
}

impl Plugin for TestPlugin {
    fn on_enable(&mut self, ctx: &PluginContext) -> anyhow::Result<()> {
        (self.on_enable)(ctx)
    }
}

impl Drop for TestPlugin {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A module that counts its own drop.
struct CountedModule {
    inner: Box<dyn PluginModule>,
    dropped: Arc<AtomicUsize>,
}

impl PluginModule for CountedModule {
    fn instantiate(&self, entry: &str) -> RuntimeResult<Box<dyn Plugin>> {
        self.inner.instantiate(entry)
    }
}

impl Drop for CountedModule {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct CountingLoader {
    inner: Arc<InProcessModuleLoader>,
    dropped: Arc<AtomicUsize>,
}

impl ModuleLoader for CountingLoader {
    fn open(&self, staged: &Path, manifest: &PluginManifest) -> RuntimeResult<Box<dyn PluginModule>> {
        Ok(Box::new(CountedModule {
            inner: self.inner.open(staged, manifest)?,
            dropped: Arc::clone(&self.dropped),
        }))
    }
}

struct Harness {
    _dir: TempDir,
    plugins_dir: PathBuf,
    loader: Arc<InProcessModuleLoader>,
    host: Arc<StandaloneHost>,
    runtime: Arc<PluginRuntime>,
    live: Arc<AtomicUsize>,
    modules_dropped: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut RuntimeConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let plugins_dir = dir.path().join("plugins");
        let mut config = RuntimeConfig::new(&plugins_dir, dir.path().join("data"));
        adjust(&mut config);

        let loader = Arc::new(InProcessModuleLoader::new());
        let modules_dropped = Arc::new(AtomicUsize::new(0));
        let counting = CountingLoader {
            inner: Arc::clone(&loader),
            dropped: Arc::clone(&modules_dropped),
        };
        let host = Arc::new(StandaloneHost::new());
        let runtime = Arc::new(
            PluginRuntime::new(
                config,
                Arc::new(counting) as Arc<dyn ModuleLoader>,
                Arc::clone(&host) as Arc<dyn HostAccess>,
            )
            .unwrap(),
        );
        Self {
            _dir: dir,
            plugins_dir,
            loader,
            host,
            runtime,
            live: Arc::new(AtomicUsize::new(0)),
            modules_dropped,
        }
    }

    /// Register code for every version of `id`.
    fn code<F>(&self, id: &str, on_enable: F)
    where
        F: Fn(&PluginContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let on_enable: EnableFn = Arc::new(on_enable);
        let live = Arc::clone(&self.live);
        self.loader.register(&entry(id), move || {
            Ok(Box::new(TestPlugin::new(Arc::clone(&on_enable), Arc::clone(&live))) as Box<dyn Plugin>)
        });
    }

    /// Register code for one version of `id`.
    fn code_for_version<F>(&self, id: &str, version: &str, on_enable: F)
    where
        F: Fn(&PluginContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let on_enable: EnableFn = Arc::new(on_enable);
        let live = Arc::clone(&self.live);
        self.loader.register_version(&entry(id), version, move || {
            Ok(Box::new(TestPlugin::new(Arc::clone(&on_enable), Arc::clone(&live))) as Box<dyn Plugin>)
        });
    }

    fn package(&self, id: &str, version: &str, deps: &[&str], permissions: &[&str]) -> PathBuf {
        write_package(&self.plugins_dir, id, version, deps, permissions)
    }

    fn data_path(&self, segments: &[&str]) -> PathBuf {
        segments
            .iter()
            .fold(self.runtime.data_root().to_path_buf(), |path, s| path.join(s))
    }
}

fn entry(id: &str) -> String {
    format!("tests.{id}")
}

fn quoted(items: &[&str]) -> String {
    items
        .iter()
        .map(|i| format!("\"{i}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn write_package(plugins_dir: &Path, id: &str, version: &str, deps: &[&str], permissions: &[&str]) -> PathBuf {
    let manifest = format!(
        "id = \"{id}\"\nname = \"Plugin {id}\"\nversion = \"{version}\"\nmain = \"{main}\"\n\
         dependencies = [{deps}]\npermissions = [{perms}]\n",
        main = entry(id),
        deps = quoted(deps),
        perms = quoted(permissions),
    );
    PackageBuilder::from_manifest_toml(manifest)
        .write_to(&plugins_dir.join(format!("{id}.kpk")))
        .unwrap()
}

fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

fn noop(_: &PluginContext) -> anyhow::Result<()> {
    Ok(())
}

// ==============================================================================
// Scanning and Dependency Order Tests
// ==============================================================================

#[test]
fn test_scan_loads_dependencies_first() {
    let h = Harness::new();
    for id in ["core", "economy", "shop"] {
        h.code(id, noop);
    }
    h.package("shop", "1.0.0", &["economy >=1.0"], &[]);
    h.package("economy", "1.2.0", &["core"], &[]);
    h.package("core", "1.0.0", &[], &[]);

    let loaded = h.runtime.scan_and_load().unwrap();
    assert_eq!(loaded, vec!["core", "economy", "shop"]);
    assert_eq!(h.runtime.loaded_plugin_ids(), loaded);
}

#[test]
fn test_scan_rejects_only_mismatched_dependent() {
    let h = Harness::new();
    h.code("core", noop);
    h.code("addon", noop);
    h.package("core", "1.0.0", &[], &[]);
    h.package("addon", "1.0.0", &["core >=2.0"], &[]);

    assert_eq!(h.runtime.scan_and_load().unwrap(), vec!["core"]);

    let scan = h.runtime.last_scan();
    assert!(scan.rejected.contains_key("addon"));
    assert!(scan.version_mismatches["addon"].contains("found '1.0.0'"));
}

#[test]
fn test_scan_skips_dependents_of_failed_plugin() {
    let h = Harness::new();
    h.code("core", |_| anyhow::bail!("core refuses to start"));
    h.code("economy", noop);
    h.package("core", "1.0.0", &[], &[]);
    h.package("economy", "1.0.0", &["core"], &[]);

    assert!(h.runtime.scan_and_load().unwrap().is_empty());
    let scan = h.runtime.last_scan();
    assert!(scan.failed["core"].contains("core refuses to start"));
    assert!(scan.failed["economy"].contains("'core'"));
}

#[test]
fn test_enabled_events_are_published() {
    let h = Harness::new();
    let enabled = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&enabled);
    h.runtime
        .events()
        .subscribe::<PluginEnabled, _>("host", move |e| seen.lock().push(e.id.clone()));

    h.code("core", noop);
    h.code("economy", noop);
    h.package("core", "1.0.0", &[], &[]);
    h.package("economy", "1.0.0", &["core"], &[]);
    h.runtime.scan_and_load().unwrap();

    assert_eq!(*enabled.lock(), vec!["core", "economy"]);
}

// ==============================================================================
// Load and Unload Tests
// ==============================================================================

#[test]
fn test_load_package_requires_loaded_dependencies() {
    let h = Harness::new();
    h.code("economy", noop);
    let path = h.package("economy", "1.0.0", &["core"], &[]);

    assert!(matches!(
        h.runtime.load_package(&path),
        Err(RuntimeError::Dependency(_))
    ));
    assert!(!h.runtime.is_loaded("economy"));
}

#[test]
fn test_unload_unknown_id_returns_false() {
    let h = Harness::new();
    h.code("core", noop);
    h.package("core", "1.0.0", &[], &[]);
    h.runtime.scan_and_load().unwrap();

    assert!(!h.runtime.unload("ghost"));
    assert_eq!(h.runtime.loaded_plugin_ids(), vec!["core"]);
}

#[test]
fn test_failed_enable_leaves_nothing_behind() {
    let h = Harness::new();
    h.code("flaky", |ctx| {
        ctx.commands
            .register("flaky", "never survives", |_| Ok(kiln_plugin_api::CommandResult::ok("")))?;
        ctx.registry.register_item(ItemDefinition::new("widget", "Widget"))?;
        anyhow::bail!("missing config")
    });
    let path = h.package("flaky", "1.0.0", &[], &[]);

    let err = h.runtime.load_package(&path).unwrap_err();
    assert!(matches!(err, RuntimeError::InitializationFailed(_)));
    assert!(err.to_string().contains("missing config"));

    assert!(!h.runtime.is_loaded("flaky"));
    assert!(h.runtime.commands().list().is_empty());
    assert_eq!(count_entries(&h.data_path(&["cache", "flaky"])), 0);
    assert_eq!(h.live.load(Ordering::SeqCst), 0);
}

// ==============================================================================
// Reload Tests
// ==============================================================================

#[test]
fn test_repeated_reloads_keep_one_copy() {
    let h = Harness::new();
    h.code("demo", noop);
    h.package("demo", "1.0.0", &[], &[]);
    h.runtime.scan_and_load().unwrap();

    for patch in 1..=25 {
        h.package("demo", &format!("1.0.{patch}"), &[], &[]);
        assert_eq!(h.runtime.reload("demo"), ReloadStatus::Success);
    }

    assert_eq!(h.runtime.loaded_plugin_ids(), vec!["demo"]);
    assert_eq!(h.runtime.manifest("demo").unwrap().version, "1.0.25");
    assert_eq!(h.live.load(Ordering::SeqCst), 1);
    assert_eq!(count_entries(&h.data_path(&["cache", "demo"])), 1);
    assert_eq!(count_entries(&h.data_path(&["checkpoints"])), 0);
}

#[test]
fn test_reload_includes_dependents() {
    let h = Harness::new();
    for id in ["core", "economy", "chat"] {
        h.code(id, noop);
    }
    h.package("core", "1.0.0", &[], &[]);
    h.package("economy", "1.0.0", &["core"], &[]);
    h.package("chat", "1.0.0", &[], &[]);
    h.runtime.scan_and_load().unwrap();

    h.package("core", "1.1.0", &[], &[]);
    let report = h.runtime.reload_with_report("core");

    assert_eq!(report.status, ReloadStatus::Success);
    assert_eq!(report.affected_plugins, vec!["core", "economy"]);
    assert_eq!(report.reloaded_plugins, vec!["core", "economy"]);
    assert_eq!(h.runtime.manifest("core").unwrap().version, "1.1.0");
}

#[test]
fn test_reload_rejected_before_anything_changes() {
    let h = Harness::new();
    h.code("core", noop);
    h.code("economy", noop);
    h.package("core", "1.0.0", &[], &[]);
    h.package("economy", "1.0.0", &["core <2.0"], &[]);
    h.runtime.scan_and_load().unwrap();

    h.package("core", "2.0.0", &[], &[]);
    let report = h.runtime.reload_with_report("core");

    assert_eq!(report.status, ReloadStatus::Failed);
    assert!(report.reason.unwrap().contains("economy"));
    assert_eq!(h.runtime.manifest("core").unwrap().version, "1.0.0");
    assert_eq!(h.runtime.loaded_plugin_ids(), vec!["core", "economy"]);
}

#[test]
fn test_failed_reload_rolls_back_code_and_data() {
    let h = Harness::new();
    h.code("bank", |ctx| {
        let balance = ctx.storage.store::<u64>("balance", 1)?;
        if balance.load()?.is_none() {
            balance.save(&100)?;
        }
        ctx.registry.register_item(ItemDefinition::new("coin", "Coin"))?;
        Ok(())
    });
    h.code_for_version("bank", "2.0.0", |ctx| {
        ctx.storage.store::<u64>("balance", 1)?.save(&999)?;
        anyhow::bail!("ledger schema is newer than this build")
    });
    h.code("shop", noop);
    h.package("bank", "1.0.0", &[], &[]);
    h.package("shop", "1.0.0", &["bank"], &[]);
    h.runtime.scan_and_load().unwrap();

    h.package("bank", "2.0.0", &[], &[]);
    let report = h.runtime.reload_with_report("bank");

    assert_eq!(report.status, ReloadStatus::RolledBack);
    assert!(report.reason.unwrap().contains("ledger schema"));
    assert_eq!(report.checkpoint_changed_plugins, vec!["bank"]);
    assert_eq!(report.rollback_recovered_plugins, vec!["bank", "shop"]);
    assert!(report.rollback_data_restored);

    assert_eq!(h.runtime.loaded_plugin_ids(), vec!["bank", "shop"]);
    assert_eq!(h.runtime.manifest("bank").unwrap().version, "1.0.0");
    let ctx = h.runtime.plugin_context("bank").unwrap();
    assert_eq!(ctx.storage.store::<u64>("balance", 1).unwrap().load().unwrap(), Some(100));
    assert!(ctx.registry.item("coin").is_some());
    assert_eq!(h.live.load(Ordering::SeqCst), 2);
    assert_eq!(count_entries(&h.data_path(&["checkpoints"])), 0);
}

#[test]
fn test_double_failure_keeps_checkpoint() {
    let h = Harness::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    h.code("fragile", move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(())
        } else {
            anyhow::bail!("module cache corrupted")
        }
    });
    h.code_for_version("fragile", "2.0.0", |_| anyhow::bail!("v2 broken"));
    h.package("fragile", "1.0.0", &[], &[]);
    h.runtime.scan_and_load().unwrap();

    h.package("fragile", "2.0.0", &[], &[]);
    let report = h.runtime.reload_with_report("fragile");

    assert_eq!(report.status, ReloadStatus::Failed);
    let reason = report.reason.unwrap();
    assert!(reason.starts_with("Reload failed: fragile"));
    assert!(reason.contains("; rollback failed: fragile"));
    assert_eq!(report.rollback_failed_plugins, vec!["fragile"]);
    assert!(!h.runtime.is_loaded("fragile"));
    assert_eq!(count_entries(&h.data_path(&["checkpoints"])), 1);
}

#[test]
fn test_nested_reload_is_rejected() {
    let h = Harness::new();
    let runtime_slot: Arc<OnceLock<Weak<PluginRuntime>>> = Arc::new(OnceLock::new());
    let nested = Arc::new(Mutex::new(None));

    h.code("alpha", noop);
    h.code("beta", noop);
    let slot = Arc::clone(&runtime_slot);
    let result = Arc::clone(&nested);
    h.code_for_version("alpha", "2.0.0", move |_| {
        if let Some(runtime) = slot.get().and_then(Weak::upgrade) {
            *result.lock() = Some(runtime.reload_with_report("beta"));
        }
        Ok(())
    });
    h.package("alpha", "1.0.0", &[], &[]);
    h.package("beta", "1.0.0", &[], &[]);
    h.runtime.scan_and_load().unwrap();
    runtime_slot.set(Arc::downgrade(&h.runtime)).unwrap();

    h.package("alpha", "2.0.0", &[], &[]);
    assert_eq!(h.runtime.reload("alpha"), ReloadStatus::Success);

    let inner = nested.lock().take().unwrap();
    assert_eq!(inner.status, ReloadStatus::Failed);
    assert_eq!(inner.reason.as_deref(), Some("reload already in progress"));
}

#[test]
fn test_reload_changed_picks_edited_roots() {
    let h = Harness::new();
    for id in ["core", "economy", "chat"] {
        h.code(id, noop);
    }
    h.package("core", "1.0.0", &[], &[]);
    h.package("economy", "1.0.0", &["core"], &[]);
    h.package("chat", "1.0.0", &[], &[]);
    h.runtime.scan_and_load().unwrap();

    h.package("core", "1.0.1-hotfix", &[], &[]);
    h.package("economy", "1.0.1-hotfix", &["core"], &[]);
    let reports = h.runtime.reload_changed_with_report();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].target, "core");
    assert_eq!(reports[0].affected_plugins, vec!["core", "economy"]);
    assert_eq!(h.runtime.manifest("economy").unwrap().version, "1.0.1-hotfix");
    assert!(h.runtime.reload_changed_with_report().is_empty());
}

#[test]
fn test_reload_unknown_plugin_fails() {
    let h = Harness::new();
    let report = h.runtime.reload_with_report("ghost");
    assert_eq!(report.status, ReloadStatus::Failed);
    assert!(report.affected_plugins.is_empty());
}

// ==============================================================================
// Host Access Tests
// ==============================================================================

#[test]
fn test_missing_write_permission_leaves_host_unchanged() {
    let h = Harness::new();
    h.host.create_world("overworld", 42).unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    h.code("viewer", move |ctx| {
        let worlds = ctx.host.worlds().len();
        let changed = ctx.host.set_world_time("overworld", 6000);
        *seen.lock() = Some((worlds, changed));
        Ok(())
    });
    let path = h.package("viewer", "1.0.0", &[], &["host.world.read"]);
    h.runtime.load_package(&path).unwrap();

    assert_eq!(*outcome.lock(), Some((1, false)));
    assert_eq!(h.host.worlds()[0].time, 0);
    assert_eq!(h.runtime.plugin_context("viewer").unwrap().host.denials(), 1);
}

// ==============================================================================
// Adapter Tests
// ==============================================================================

struct LateBroadcast {
    host: Arc<ScopedHostAccess>,
}

#[async_trait]
impl ModAdapter for LateBroadcast {
    fn id(&self) -> &str {
        "late"
    }

    async fn invoke(&self, _invocation: AdapterInvocation) -> anyhow::Result<AdapterPayload> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.host.broadcast("too late");
        Ok(BTreeMap::new())
    }
}

fn adapter_harness() -> Harness {
    let h = Harness::with_config(|config| {
        config.adapters.max_calls_per_minute = 3;
        config.adapters.invocation_timeout_millis = 50;
    });
    h.code("relay", |ctx| {
        ctx.adapters.register(Arc::new(FnAdapter::new("echo", &["relay.echo"], |inv| {
            Ok(inv.payload.clone())
        })))?;
        ctx.adapters.register(Arc::new(LateBroadcast {
            host: Arc::clone(&ctx.host),
        }))?;
        let host = Arc::clone(&ctx.host);
        ctx.adapters.register(Arc::new(FnAdapter::new("stall", &[], move |_| {
            std::thread::sleep(Duration::from_millis(300));
            host.broadcast("stalled");
            Ok(BTreeMap::new())
        })))?;
        Ok(())
    });
    let path = h.package("relay", "1.0.0", &[], &["host.server.broadcast"]);
    h.runtime.load_package(&path).unwrap();
    h
}

#[tokio::test]
async fn test_rate_limited_invocation_counts_as_denied_only() {
    let h = adapter_harness();
    for _ in 0..3 {
        let response = h
            .runtime
            .invoke_adapter("relay", "echo", AdapterInvocation::new("ping").with("n", "1"))
            .await;
        assert!(response.is_accepted());
    }
    let limited = h
        .runtime
        .invoke_adapter("relay", "echo", AdapterInvocation::new("ping"))
        .await;
    assert_eq!(limited.outcome, AdapterOutcome::Denied);
    assert!(limited.message.unwrap().contains("rate limit exceeded"));

    let stats = h.runtime.profile("relay").unwrap().adapters;
    let echo = stats.iter().find(|a| a.id == "echo").unwrap();
    assert_eq!((echo.total, echo.accepted, echo.denied), (4, 3, 1));
    assert_eq!((echo.timeouts, echo.failures), (0, 0));
    assert_eq!(h.runtime.metrics().fault_budget("relay").used, 0);
}

#[tokio::test]
async fn test_timed_out_invocation_never_mutates_later() {
    let h = adapter_harness();
    let response = h
        .runtime
        .invoke_adapter("relay", "late", AdapterInvocation::new("announce"))
        .await;

    assert_eq!(response.outcome, AdapterOutcome::Timeout);
    assert!(response.message.unwrap().contains("timed out after 50ms"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.host.broadcasts().is_empty());
    assert_eq!(
        h.runtime.metrics().fault_budget("relay").sources.get("adapter:late"),
        Some(&1)
    );
}

#[tokio::test]
async fn test_blocking_adapter_times_out_without_side_effects() {
    let h = adapter_harness();
    let started = Instant::now();
    let response = h
        .runtime
        .invoke_adapter("relay", "stall", AdapterInvocation::new("announce"))
        .await;

    assert_eq!(response.outcome, AdapterOutcome::Timeout);
    assert!(started.elapsed() < Duration::from_millis(250));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.host.broadcasts().is_empty());
    let ctx = h.runtime.plugin_context("relay").unwrap();
    assert_eq!(ctx.host.denials(), 1);
}

#[tokio::test]
async fn test_required_capability_and_unloaded_plugin() {
    let h = adapter_harness();
    let denied = h
        .runtime
        .invoke_adapter(
            "relay",
            "echo",
            AdapterInvocation::new("ping").with(REQUIRED_CAPABILITY_KEY, "relay.admin"),
        )
        .await;
    assert_eq!(denied.outcome, AdapterOutcome::Denied);

    assert!(h.runtime.unload("relay"));
    let gone = h
        .runtime
        .invoke_adapter("relay", "echo", AdapterInvocation::new("ping"))
        .await;
    assert_eq!(gone.outcome, AdapterOutcome::Denied);
}

// ==============================================================================
// Module Lifetime Tests
// ==============================================================================

#[tokio::test]
async fn test_module_outlives_adapter_body_still_running() {
    let h = Harness::with_config(|config| config.adapters.invocation_timeout_millis = 50);
    h.code("vault", |ctx| {
        ctx.adapters.register(Arc::new(FnAdapter::new("seal", &[], |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(BTreeMap::new())
        })))?;
        Ok(())
    });
    let path = h.package("vault", "1.0.0", &[], &[]);
    h.runtime.load_package(&path).unwrap();

    let response = h
        .runtime
        .invoke_adapter("vault", "seal", AdapterInvocation::new("close"))
        .await;
    assert_eq!(response.outcome, AdapterOutcome::Timeout);

    assert!(h.runtime.unload("vault"));
    assert_eq!(h.live.load(Ordering::SeqCst), 0);
    assert_eq!(h.modules_dropped.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.modules_dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_retained_context_keeps_module_loaded() {
    let h = Harness::new();
    h.code("keeper", |ctx| {
        ctx.commands
            .register("keep", "Keeps things", |_| Ok(kiln_plugin_api::CommandResult::ok("kept")))?;
        Ok(())
    });
    let path = h.package("keeper", "1.0.0", &[], &[]);
    h.runtime.load_package(&path).unwrap();

    let retained = h.runtime.plugin_context("keeper").unwrap();
    assert!(h.runtime.unload("keeper"));
    assert_eq!(h.live.load(Ordering::SeqCst), 0);
    assert_eq!(h.modules_dropped.load(Ordering::SeqCst), 0);

    drop(retained);
    assert_eq!(h.modules_dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_loads_of_one_plugin_enable_once() {
    let h = Harness::new();
    let enables = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&enables);
    h.code("twin", move |ctx| {
        counted.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(150));
        ctx.commands
            .register("twin", "Answers", |_| Ok(kiln_plugin_api::CommandResult::ok("here")))?;
        Ok(())
    });
    let path = h.package("twin", "1.0.0", &[], &[]);

    let results: Vec<RuntimeResult<String>> = std::thread::scope(|scope| {
        let first = scope.spawn(|| h.runtime.load_package(&path));
        std::thread::sleep(Duration::from_millis(30));
        let second = scope.spawn(|| h.runtime.load_package(&path));
        vec![first.join().unwrap(), second.join().unwrap()]
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(RuntimeError::AlreadyLoaded(id)) if id == "twin")));
    assert_eq!(enables.load(Ordering::SeqCst), 1);
    assert_eq!(h.live.load(Ordering::SeqCst), 1);
    assert!(h.runtime.execute_command("twin", "console", &[]).success);
    assert_eq!(h.runtime.plugin_state("twin"), kiln_plugin_api::PluginState::Enabled);
}

// ==============================================================================
// Registration, Tick and Diagnostics Tests
// ==============================================================================

#[test]
fn test_duplicate_registrations_keep_first() {
    let h = Harness::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&errors);
    h.code("tools", move |ctx| {
        ctx.registry.register_item(ItemDefinition::new("hammer", "Hammer"))?;
        let mut errors = seen.lock();
        if let Err(e) = ctx.registry.register_item(ItemDefinition::new("hammer", "Mallet")) {
            errors.push(e.to_string());
        }
        ctx.registry.register_system("wear", |_| Ok(()))?;
        if let Err(e) = ctx.registry.register_system("wear", |_| anyhow::bail!("second")) {
            errors.push(e.to_string());
        }
        ctx.adapters
            .register(Arc::new(FnAdapter::new("forge", &[], |_| Ok(BTreeMap::new()))))?;
        if let Err(e) = ctx
            .adapters
            .register(Arc::new(FnAdapter::new("forge", &[], |_| Ok(BTreeMap::new()))))
        {
            errors.push(e.to_string());
        }
        Ok(())
    });
    let path = h.package("tools", "1.0.0", &[], &[]);
    h.runtime.load_package(&path).unwrap();

    assert_eq!(
        *errors.lock(),
        vec![
            "Duplicate item id 'hammer' in plugin 'tools'",
            "Duplicate system id 'wear' in plugin 'tools'",
            "Duplicate adapter id 'forge' in plugin 'tools'",
        ]
    );
    let ctx = h.runtime.plugin_context("tools").unwrap();
    assert_eq!(ctx.registry.item("hammer").unwrap().display_name, "Hammer");
    assert_eq!(ctx.adapters.len(), 1);

    h.runtime.tick();
    assert_eq!(h.runtime.metrics().fault_budget("tools").used, 0);
}

#[test]
fn test_tick_runs_tasks_and_isolates_failing_systems() {
    let h = Harness::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    h.code("farm", move |ctx| {
        let counter = Arc::clone(&counter);
        ctx.scheduler.repeating("grow", 1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;
        ctx.registry
            .register_system("broken", |tick| anyhow::bail!("bad state at tick {tick}"))?;
        Ok(())
    });
    let path = h.package("farm", "1.0.0", &[], &[]);
    h.runtime.load_package(&path).unwrap();

    for _ in 0..3 {
        h.runtime.tick();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    let diagnostics = h.runtime.diagnostics();
    let farm = &diagnostics.performance["farm"];
    assert_eq!(farm.isolated_systems.len(), 1);
    assert_eq!(farm.fault_budget.sources.get("system:broken"), Some(&3));

    h.runtime.tick();
    let systems = h.runtime.profile("farm").unwrap().systems;
    assert_eq!(systems[0].runs, 3);
}

#[test]
fn test_diagnostics_report_graph_and_dependency_issues() {
    let h = Harness::new();
    h.code("core", noop);
    h.code("economy", noop);
    h.package("core", "1.0.0", &[], &[]);
    h.package("economy", "1.0.0", &["core"], &[]);
    h.runtime.scan_and_load().unwrap();

    let before = h.runtime.diagnostics();
    assert_eq!(before.dependency_graph["economy"], vec!["core"]);
    assert!(before.dependency_issues.is_empty());
    assert_eq!(before.api_compatibility["core"], "compatible");

    assert!(h.runtime.unload("core"));
    let after = h.runtime.diagnostics();
    assert_eq!(after.load_order, vec!["economy"]);
    assert!(after.dependency_issues.contains_key("economy"));
    assert!(after.dependency_graph["economy"].is_empty());
}

#[test]
fn test_shutdown_drops_every_instance() {
    let h = Harness::new();
    h.code("core", noop);
    h.code("economy", noop);
    h.package("core", "1.0.0", &[], &[]);
    h.package("economy", "1.0.0", &["core"], &[]);
    h.runtime.scan_and_load().unwrap();
    assert_eq!(h.live.load(Ordering::SeqCst), 2);

    h.runtime.shutdown();
    assert!(h.runtime.loaded_plugin_ids().is_empty());
    assert_eq!(h.live.load(Ordering::SeqCst), 0);
}
