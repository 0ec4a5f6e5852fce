//! Adapters: capability-checked, rate-limited entry points a plugin exposes
//! to the host and to other plugins.
//!
//! Every invocation passes the same gate, in order: sandbox closed, adapter
//! known, action well-formed, payload within limits, required capability
//! held, rate limits, concurrency. Only then is the adapter body run, on its
//! own task and under a timeout in safe mode. Every outcome is reported to
//! [`RuntimeMetrics`], and failures and timeouts count against the plugin's
//! fault budget as `adapter:<id>`.
//!
//! A body runs inside an invocation scope. Once its timeout fires the scope
//! is marked expired, and host calls made from it are refused, so a body
//! that keeps running in the background cannot change anything. The scope
//! also pins the plugin's module until the body has returned.

use crate::config::{AdapterSecurityConfig, ExecutionMode};
use crate::metrics::{AdapterOutcome, RuntimeMetrics};
use crate::module::ModuleGuard;
use crate::plugin::{call_guarded, panic_message};
use crate::rate::RateWindow;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kiln_runtime::{RuntimeError, RuntimeResult};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Payload key naming a capability the adapter must declare.
pub const REQUIRED_CAPABILITY_KEY: &str = "required_capability";

pub type AdapterPayload = BTreeMap<String, String>;

static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

tokio::task_local! {
    static INVOCATION: InvocationScope;
}

#[derive(Clone, Default)]
struct InvocationScope {
    expired: Arc<AtomicBool>,
    module: ModuleGuard,
}

/// Whether the adapter invocation running on this task or thread has timed
/// out. Always `false` outside an adapter body.
pub fn invocation_expired() -> bool {
    INVOCATION
        .try_with(|scope| scope.expired.load(Ordering::Acquire))
        .unwrap_or(false)
}

fn token_re() -> &'static Regex {
    TOKEN_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._:-]{1,64}$").expect("valid token regex"))
}

/// A call into an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInvocation {
    pub action: String,
    pub payload: AdapterPayload,
    /// Plugin or host component making the call, for audit logs.
    pub caller: Option<String>,
}

impl AdapterInvocation {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            payload: BTreeMap::new(),
            caller: None,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn from_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterResponse {
    pub outcome: AdapterOutcome,
    pub payload: AdapterPayload,
    pub message: Option<String>,
}

impl AdapterResponse {
    pub fn accepted(payload: AdapterPayload) -> Self {
        Self {
            outcome: AdapterOutcome::Accepted,
            payload,
            message: None,
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::rejected(AdapterOutcome::Denied, message.into())
    }

    fn rejected(outcome: AdapterOutcome, message: String) -> Self {
        Self {
            outcome,
            payload: BTreeMap::new(),
            message: Some(message),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome == AdapterOutcome::Accepted
    }
}

/// Implemented by adapter bodies.
#[async_trait]
pub trait ModAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    /// Capability tokens this adapter provides.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(&self, invocation: AdapterInvocation) -> anyhow::Result<AdapterPayload>;
}

type SyncHandler = Arc<dyn Fn(&AdapterInvocation) -> anyhow::Result<AdapterPayload> + Send + Sync>;

/// Adapter built from a synchronous closure.
///
/// The closure runs on the blocking pool, so a slow body never holds up the
/// executor and the sandbox timeout still fires.
pub struct FnAdapter {
    id: String,
    capabilities: Vec<String>,
    handler: SyncHandler,
}

impl FnAdapter {
    pub fn new<F>(id: impl Into<String>, capabilities: &[&str], handler: F) -> Self
    where
        F: Fn(&AdapterInvocation) -> anyhow::Result<AdapterPayload> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl ModAdapter for FnAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn invoke(&self, invocation: AdapterInvocation) -> anyhow::Result<AdapterPayload> {
        let handler = Arc::clone(&self.handler);
        let scope = INVOCATION.try_with(InvocationScope::clone).unwrap_or_default();
        let label = format!("Adapter '{}'", self.id);
        let body = tokio::task::spawn_blocking(move || {
            let result = call_guarded(&label, || INVOCATION.sync_scope(scope.clone(), || handler(&invocation)));
            // The handler's code belongs to the module the scope pins.
            drop(handler);
            drop(scope);
            result
        });
        match body.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("Adapter '{}' was cancelled: {}", self.id, e)),
        }
    }
}

/// Listing entry for a registered adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
}

/// Field order matters: the adapter is dropped before its module.
struct RegisteredAdapter {
    adapter: Arc<dyn ModAdapter>,
    capabilities: Vec<String>,
    rate: RateWindow,
    module: ModuleGuard,
}

struct ConcurrencyGuard<'a>(&'a AtomicUsize);

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A call that passed the gate. Holds its concurrency slot until dropped.
struct Admission<'a> {
    registered: Arc<RegisteredAdapter>,
    _slot: ConcurrencyGuard<'a>,
}

struct Denial {
    response: AdapterResponse,
    /// Whether the id named a registered adapter.
    known_adapter: bool,
}

impl Denial {
    fn unknown(response: AdapterResponse) -> Self {
        Self {
            response,
            known_adapter: false,
        }
    }

    fn known(response: AdapterResponse) -> Self {
        Self {
            response,
            known_adapter: true,
        }
    }
}

/// One plugin's adapters and the gate in front of them.
pub struct AdapterSandbox {
    plugin_id: String,
    config: AdapterSecurityConfig,
    metrics: Arc<RuntimeMetrics>,
    adapters: DashMap<String, Arc<RegisteredAdapter>>,
    plugin_rate: RateWindow,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    module: ModuleGuard,
}

impl AdapterSandbox {
    pub fn new(plugin_id: impl Into<String>, config: AdapterSecurityConfig, metrics: Arc<RuntimeMetrics>) -> Self {
        let plugin_rate = RateWindow::per_minute(config.max_calls_per_minute_per_plugin);
        Self {
            plugin_id: plugin_id.into(),
            config,
            metrics,
            adapters: DashMap::new(),
            plugin_rate,
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            module: ModuleGuard::none(),
        }
    }

    /// Pin `module` into every adapter registered from now on.
    pub fn with_module(mut self, module: ModuleGuard) -> Self {
        self.module = module;
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn register(&self, adapter: Arc<dyn ModAdapter>) -> RuntimeResult<()> {
        if self.is_closed() {
            return Err(RuntimeError::InvalidRegistration(format!(
                "plugin '{}' is unloading",
                self.plugin_id
            )));
        }
        let id = adapter.id().to_string();
        if !token_re().is_match(&id) {
            return Err(RuntimeError::InvalidRegistration(format!(
                "adapter id '{}' in plugin '{}' must match [A-Za-z0-9._:-]{{1,64}}",
                id, self.plugin_id
            )));
        }
        let capabilities = adapter.capabilities();
        if let Some(bad) = capabilities.iter().find(|c| !token_re().is_match(c)) {
            return Err(RuntimeError::InvalidRegistration(format!(
                "adapter '{}' in plugin '{}' declares invalid capability '{}'",
                id, self.plugin_id, bad
            )));
        }

        match self.adapters.entry(id) {
            Entry::Occupied(entry) => Err(RuntimeError::DuplicateRegistration(format!(
                "Duplicate adapter id '{}' in plugin '{}'",
                entry.key(),
                self.plugin_id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(RegisteredAdapter {
                    adapter,
                    capabilities: capabilities.iter().map(|c| c.to_ascii_lowercase()).collect(),
                    rate: RateWindow::per_minute(self.config.max_calls_per_minute),
                    module: self.module.clone(),
                }));
                Ok(())
            }
        }
    }

    pub fn list(&self) -> Vec<AdapterInfo> {
        let mut adapters: Vec<AdapterInfo> = self
            .adapters
            .iter()
            .map(|entry| AdapterInfo {
                id: entry.key().clone(),
                name: entry.adapter.name().to_string(),
                version: entry.adapter.version().to_string(),
                capabilities: entry.adapter.capabilities(),
            })
            .collect();
        adapters.sort_by(|a, b| a.id.cmp(&b.id));
        adapters
    }

    pub fn find(&self, adapter_id: &str) -> Option<AdapterInfo> {
        let entry = self.adapters.get(adapter_id)?;
        Some(AdapterInfo {
            id: adapter_id.to_string(),
            name: entry.adapter.name().to_string(),
            version: entry.adapter.version().to_string(),
            capabilities: entry.adapter.capabilities(),
        })
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse further invocations and drop every adapter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.adapters.clear();
    }

    pub async fn invoke(&self, adapter_id: &str, invocation: AdapterInvocation) -> AdapterResponse {
        let started = Instant::now();
        let (response, known_adapter) = match self.admit(adapter_id, &invocation) {
            Ok(admission) => (self.run(admission, invocation.clone()).await, true),
            Err(denial) => (denial.response, denial.known_adapter),
        };
        let elapsed = started.elapsed();

        // Unknown ids share one counter so callers cannot grow the metrics table.
        if known_adapter {
            self.metrics
                .record_adapter_invocation(&self.plugin_id, adapter_id, response.outcome, elapsed);
        } else {
            self.metrics.record_unknown_adapter(&self.plugin_id);
        }
        if matches!(response.outcome, AdapterOutcome::Failed | AdapterOutcome::Timeout) {
            self.metrics
                .record_fault(&self.plugin_id, &format!("adapter:{adapter_id}"));
        }
        self.audit(adapter_id, &invocation, &response, elapsed);
        response
    }

    fn admit(&self, adapter_id: &str, invocation: &AdapterInvocation) -> Result<Admission<'_>, Denial> {
        if self.is_closed() {
            return Err(Denial::unknown(AdapterResponse::denied(format!(
                "plugin '{}' is unloading",
                self.plugin_id
            ))));
        }
        let registered = self
            .adapters
            .get(adapter_id)
            .map(|a| Arc::clone(&a))
            .ok_or_else(|| Denial::unknown(AdapterResponse::denied(format!("Unknown adapter '{adapter_id}'"))))?;

        if !token_re().is_match(&invocation.action) {
            return Err(Denial::known(AdapterResponse::denied(format!(
                "Invalid adapter action '{}'",
                invocation.action
            ))));
        }
        self.check_payload(&invocation.payload).map_err(Denial::known)?;

        if let Some(required) = invocation.payload.get(REQUIRED_CAPABILITY_KEY) {
            let required = required.trim().to_ascii_lowercase();
            if !registered.capabilities.contains(&required) {
                return Err(Denial::known(AdapterResponse::denied(format!(
                    "Adapter '{adapter_id}' lacks capability '{required}'"
                ))));
            }
        }

        // Every limit is checked before any slot is taken, so a call refused
        // by a later limit leaves the earlier budgets untouched.
        let adapter_limited = || {
            Denial::known(AdapterResponse::denied(format!(
                "rate limit exceeded for adapter '{}' ({}/min)",
                adapter_id, self.config.max_calls_per_minute
            )))
        };
        let plugin_limited = || {
            Denial::known(AdapterResponse::denied(format!(
                "rate limit exceeded for plugin '{}' ({}/min)",
                self.plugin_id, self.config.max_calls_per_minute_per_plugin
            )))
        };
        if !registered.rate.has_capacity() {
            return Err(adapter_limited());
        }
        if !self.plugin_rate.has_capacity() {
            return Err(plugin_limited());
        }
        let slot = self.enter().ok_or_else(|| {
            Denial::known(AdapterResponse::denied(format!(
                "Too many concurrent invocations for plugin '{}' (max {})",
                self.plugin_id, self.config.max_concurrent_invocations
            )))
        })?;
        // Lost a race for the last slot of a window.
        if !registered.rate.try_acquire() {
            return Err(adapter_limited());
        }
        if !self.plugin_rate.try_acquire() {
            return Err(plugin_limited());
        }

        Ok(Admission {
            registered,
            _slot: slot,
        })
    }

    fn enter(&self) -> Option<ConcurrencyGuard<'_>> {
        let limit = self.config.max_concurrent_invocations;
        if limit == 0 {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        } else {
            self.in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
                .ok()?;
        }
        Some(ConcurrencyGuard(&self.in_flight))
    }

    fn check_payload(&self, payload: &AdapterPayload) -> Result<(), AdapterResponse> {
        let c = &self.config;
        if payload.len() > c.max_payload_entries {
            return Err(AdapterResponse::denied(format!(
                "payload exceeds {} entries (got {})",
                c.max_payload_entries,
                payload.len()
            )));
        }
        let mut total = 0usize;
        for (key, value) in payload {
            let key_chars = key.chars().count();
            let value_chars = value.chars().count();
            if key.trim().is_empty() || key_chars > c.max_payload_key_chars {
                return Err(AdapterResponse::denied(format!(
                    "Payload key '{}' must be 1..={} characters",
                    key, c.max_payload_key_chars
                )));
            }
            if value_chars > c.max_payload_value_chars {
                return Err(AdapterResponse::denied(format!(
                    "Payload value for '{}' exceeds {} characters",
                    key, c.max_payload_value_chars
                )));
            }
            if key.chars().chain(value.chars()).any(|ch| ch.is_control() && ch != '\n' && ch != '\t') {
                return Err(AdapterResponse::denied(format!(
                    "Payload entry '{key}' contains control characters"
                )));
            }
            total += key_chars + value_chars;
        }
        if total > c.max_payload_total_chars {
            return Err(AdapterResponse::denied(format!(
                "payload exceeds {1} total characters (got {0})",
                total, c.max_payload_total_chars
            )));
        }
        Ok(())
    }

    async fn run(&self, admission: Admission<'_>, invocation: AdapterInvocation) -> AdapterResponse {
        let registered = Arc::clone(&admission.registered);
        let adapter_id = registered.adapter.id().to_string();
        let scope = InvocationScope {
            expired: Arc::new(AtomicBool::new(false)),
            module: registered.module.clone(),
        };

        let response = match self.config.execution_mode {
            ExecutionMode::Fast => match INVOCATION.scope(scope, registered.adapter.invoke(invocation)).await {
                Ok(payload) => AdapterResponse::accepted(payload),
                Err(e) => AdapterResponse::rejected(AdapterOutcome::Failed, format!("{e:#}")),
            },
            ExecutionMode::Safe => {
                let timeout = Duration::from_millis(self.config.invocation_timeout_millis);
                let expired = Arc::clone(&scope.expired);
                let body = Arc::clone(&registered);
                let mut task = tokio::spawn(INVOCATION.scope(scope, async move { body.adapter.invoke(invocation).await }));
                match tokio::time::timeout(timeout, &mut task).await {
                    Ok(Ok(Ok(payload))) => AdapterResponse::accepted(payload),
                    Ok(Ok(Err(e))) => AdapterResponse::rejected(AdapterOutcome::Failed, format!("{e:#}")),
                    Ok(Err(join_error)) => {
                        let message = if join_error.is_panic() {
                            format!("Adapter '{}' panicked: {}", adapter_id, panic_message(&*join_error.into_panic()))
                        } else {
                            format!("Adapter '{adapter_id}' was cancelled")
                        };
                        AdapterResponse::rejected(AdapterOutcome::Failed, message)
                    }
                    Err(_) => {
                        expired.store(true, Ordering::Release);
                        task.abort();
                        AdapterResponse::rejected(
                            AdapterOutcome::Timeout,
                            format!("Adapter '{}' timed out after {}ms", adapter_id, timeout.as_millis()),
                        )
                    }
                }
            }
        };
        drop(admission);
        response
    }

    fn audit(&self, adapter_id: &str, invocation: &AdapterInvocation, response: &AdapterResponse, elapsed: Duration) {
        if !self.config.audit_log_enabled {
            return;
        }
        let caller = invocation.caller.as_deref().unwrap_or("host");
        match response.outcome {
            AdapterOutcome::Accepted => {
                if self.config.audit_log_successes {
                    info!(
                        target: "kiln::audit",
                        plugin = %self.plugin_id,
                        adapter = %adapter_id,
                        action = %invocation.action,
                        caller,
                        elapsed_us = elapsed.as_micros() as u64,
                        "Adapter invocation accepted"
                    );
                }
            }
            outcome => warn!(
                target: "kiln::audit",
                plugin = %self.plugin_id,
                adapter = %adapter_id,
                action = %invocation.action,
                caller,
                outcome = ?outcome,
                "Adapter invocation rejected: {}",
                response.message.as_deref().unwrap_or("")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn sandbox(config: AdapterSecurityConfig) -> (AdapterSandbox, Arc<RuntimeMetrics>) {
        let metrics = Arc::new(RuntimeMetrics::default());
        (AdapterSandbox::new("bank", config, Arc::clone(&metrics)), metrics)
    }

    fn echo() -> Arc<dyn ModAdapter> {
        Arc::new(FnAdapter::new("ledger", &["economy.read"], |inv| {
            let mut out = inv.payload.clone();
            out.insert("action".into(), inv.action.clone());
            Ok(out)
        }))
    }

    #[tokio::test]
    async fn test_accepted_invocation() {
        let (sandbox, metrics) = sandbox(AdapterSecurityConfig::default());
        sandbox.register(echo()).unwrap();

        let response = sandbox
            .invoke("ledger", AdapterInvocation::new("balance").with("player", "alex"))
            .await;
        assert!(response.is_accepted());
        assert_eq!(response.payload.get("action").map(String::as_str), Some("balance"));

        let profile = metrics.profile("bank").unwrap();
        assert_eq!(profile.adapters[0].accepted, 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_registration() {
        let (sandbox, _) = sandbox(AdapterSecurityConfig::default());
        sandbox.register(echo()).unwrap();
        let err = sandbox.register(echo()).unwrap_err();
        assert_eq!(err.to_string(), "Duplicate adapter id 'ledger' in plugin 'bank'");

        let bad = Arc::new(FnAdapter::new("has space", &[], |_| Ok(BTreeMap::new())));
        assert!(sandbox.register(bad).is_err());
        assert_eq!(sandbox.len(), 1);
    }

    #[tokio::test]
    async fn test_gate_order_and_denials() {
        let (sandbox, _) = sandbox(AdapterSecurityConfig {
            max_payload_entries: 2,
            ..AdapterSecurityConfig::default()
        });
        sandbox.register(echo()).unwrap();

        let unknown = sandbox.invoke("nope", AdapterInvocation::new("x")).await;
        assert_eq!(unknown.outcome, AdapterOutcome::Denied);

        let bad_action = sandbox.invoke("ledger", AdapterInvocation::new("drop table")).await;
        assert!(bad_action.message.unwrap().contains("Invalid adapter action"));

        let too_big = sandbox
            .invoke(
                "ledger",
                AdapterInvocation::new("x").with("a", "1").with("b", "2").with("c", "3"),
            )
            .await;
        assert!(too_big.message.unwrap().contains("payload exceeds 2 entries"));

        let missing_cap = sandbox
            .invoke(
                "ledger",
                AdapterInvocation::new("x").with(REQUIRED_CAPABILITY_KEY, "economy.write"),
            )
            .await;
        assert!(missing_cap.message.unwrap().contains("lacks capability"));

        let held_cap = sandbox
            .invoke(
                "ledger",
                AdapterInvocation::new("x").with(REQUIRED_CAPABILITY_KEY, "ECONOMY.READ"),
            )
            .await;
        assert!(held_cap.is_accepted());
    }

    #[tokio::test]
    async fn test_rate_limit_counts_only_denials() {
        let (sandbox, metrics) = sandbox(AdapterSecurityConfig {
            max_calls_per_minute: 2,
            ..AdapterSecurityConfig::default()
        });
        sandbox.register(echo()).unwrap();

        for _ in 0..2 {
            assert!(sandbox.invoke("ledger", AdapterInvocation::new("x")).await.is_accepted());
        }
        let limited = sandbox.invoke("ledger", AdapterInvocation::new("x")).await;
        assert_eq!(limited.outcome, AdapterOutcome::Denied);

        let stats = &metrics.profile("bank").unwrap().adapters[0];
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.denied, 1);
        assert_eq!(metrics.fault_budget("bank").used, 0);
    }

    struct SlowAdapter {
        completed: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ModAdapter for SlowAdapter {
        fn id(&self) -> &str {
            "slow"
        }

        async fn invoke(&self, _invocation: AdapterInvocation) -> anyhow::Result<AdapterPayload> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(BTreeMap::new())
        }
    }

    #[tokio::test]
    async fn test_timeout_aborts_body() {
        let (sandbox, metrics) = sandbox(AdapterSecurityConfig {
            invocation_timeout_millis: 30,
            ..AdapterSecurityConfig::default()
        });
        let completed = Arc::new(AtomicU32::new(0));
        sandbox
            .register(Arc::new(SlowAdapter {
                completed: Arc::clone(&completed),
            }))
            .unwrap();

        let response = sandbox.invoke("slow", AdapterInvocation::new("x")).await;
        assert_eq!(response.outcome, AdapterOutcome::Timeout);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(
            metrics.fault_budget("bank").sources.get("adapter:slow"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_failures_and_panics() {
        let (sandbox, metrics) = sandbox(AdapterSecurityConfig::default());
        sandbox
            .register(Arc::new(FnAdapter::new("err", &[], |_| anyhow::bail!("ledger locked"))))
            .unwrap();
        sandbox
            .register(Arc::new(FnAdapter::new("boom", &[], |_| panic!("bad adapter"))))
            .unwrap();

        let failed = sandbox.invoke("err", AdapterInvocation::new("x")).await;
        assert_eq!(failed.outcome, AdapterOutcome::Failed);
        assert_eq!(failed.message.as_deref(), Some("ledger locked"));

        let panicked = sandbox.invoke("boom", AdapterInvocation::new("x")).await;
        assert_eq!(panicked.outcome, AdapterOutcome::Failed);
        assert!(panicked.message.unwrap().contains("bad adapter"));

        assert_eq!(metrics.fault_budget("bank").used, 2);
    }

    #[tokio::test]
    async fn test_blocking_body_is_cut_off_and_sees_expiry() {
        let (sandbox, metrics) = sandbox(AdapterSecurityConfig {
            invocation_timeout_millis: 30,
            ..AdapterSecurityConfig::default()
        });
        let saw_expiry = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&saw_expiry);
        sandbox
            .register(Arc::new(FnAdapter::new("vault", &[], move |_| {
                std::thread::sleep(Duration::from_millis(300));
                seen.store(invocation_expired(), Ordering::SeqCst);
                Ok(BTreeMap::new())
            })))
            .unwrap();

        let started = Instant::now();
        let response = sandbox.invoke("vault", AdapterInvocation::new("open")).await;
        assert_eq!(response.outcome, AdapterOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_millis(250));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(saw_expiry.load(Ordering::SeqCst));
        assert!(!invocation_expired());
        assert_eq!(metrics.fault_budget("bank").used, 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_share_one_counter() {
        let (sandbox, metrics) = sandbox(AdapterSecurityConfig::default());
        sandbox.register(echo()).unwrap();

        for i in 0..1000 {
            let response = sandbox.invoke(&format!("ghost-{i}"), AdapterInvocation::new("x")).await;
            assert_eq!(response.outcome, AdapterOutcome::Denied);
        }
        assert!(sandbox.invoke("ledger", AdapterInvocation::new("x")).await.is_accepted());

        let profile = metrics.profile("bank").unwrap();
        assert_eq!(profile.adapters.len(), 1);
        assert_eq!(profile.adapters[0].id, "ledger");
        assert_eq!(profile.unknown_adapter_denials, 1000);
    }

    #[tokio::test]
    async fn test_plugin_limit_leaves_adapter_budget() {
        let (sandbox, _) = sandbox(AdapterSecurityConfig {
            max_calls_per_minute: 2,
            max_calls_per_minute_per_plugin: 1,
            ..AdapterSecurityConfig::default()
        });
        sandbox.register(echo()).unwrap();

        assert!(sandbox.invoke("ledger", AdapterInvocation::new("x")).await.is_accepted());
        let limited = sandbox.invoke("ledger", AdapterInvocation::new("x")).await;
        assert!(limited.message.unwrap().contains("rate limit exceeded for plugin 'bank'"));

        let registered = sandbox.adapters.get("ledger").map(|a| Arc::clone(&a)).unwrap();
        assert_eq!(registered.rate.in_window(), 1);
        assert_eq!(sandbox.plugin_rate.in_window(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrency_denial_leaves_rate_budgets() {
        let (sandbox, _) = sandbox(AdapterSecurityConfig {
            max_calls_per_minute: 5,
            max_calls_per_minute_per_plugin: 5,
            max_concurrent_invocations: 1,
            invocation_timeout_millis: 1000,
            ..AdapterSecurityConfig::default()
        });
        let sandbox = Arc::new(sandbox);
        sandbox
            .register(Arc::new(SlowAdapter {
                completed: Arc::new(AtomicU32::new(0)),
            }))
            .unwrap();

        let first = {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move { sandbox.invoke("slow", AdapterInvocation::new("x")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let busy = sandbox.invoke("slow", AdapterInvocation::new("x")).await;
        assert!(busy.message.unwrap().contains("Too many concurrent invocations"));

        assert!(first.await.unwrap().is_accepted());
        let registered = sandbox.adapters.get("slow").map(|a| Arc::clone(&a)).unwrap();
        assert_eq!(registered.rate.in_window(), 1);
        assert_eq!(sandbox.plugin_rate.in_window(), 1);
    }

    #[tokio::test]
    async fn test_closed_sandbox_denies() {
        let (sandbox, _) = sandbox(AdapterSecurityConfig::default());
        sandbox.register(echo()).unwrap();
        sandbox.close();

        let response = sandbox.invoke("ledger", AdapterInvocation::new("x")).await;
        assert_eq!(response.outcome, AdapterOutcome::Denied);
        assert!(sandbox.register(echo()).is_err());
        assert!(sandbox.is_empty());
    }
}
