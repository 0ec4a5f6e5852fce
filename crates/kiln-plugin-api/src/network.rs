//! Plugin-to-plugin messaging over named channels.
//!
//! A plugin registers a channel with a schema version and limits; any plugin
//! may then subscribe or send. Sends are checked in a fixed order (schema,
//! payload, sender quota, in-flight) and delivered synchronously to every
//! listener. When a plugin unloads, its subscriptions and the channels it
//! owns are removed.

use crate::module::{ModuleGuard, Pinned};
use crate::plugin::panic_message;
use crate::rate::RateWindow;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kiln_runtime::{RuntimeError, RuntimeResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: String,
    pub schema_version: u32,
    pub max_in_flight: usize,
    pub max_messages_per_minute: usize,
    pub max_payload_entries: usize,
    pub max_payload_total_chars: usize,
}

impl ChannelSpec {
    pub fn new(id: impl Into<String>, schema_version: u32) -> Self {
        Self {
            id: id.into(),
            schema_version,
            max_in_flight: 64,
            max_messages_per_minute: 600,
            max_payload_entries: 64,
            max_payload_total_chars: 16_384,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMessage {
    pub schema_version: u32,
    pub payload: BTreeMap<String, String>,
    /// Filled in by the hub with the sender when left empty.
    pub source_plugin_id: Option<String>,
    /// Set by the hub on delivery.
    pub channel: String,
}

impl PluginMessage {
    pub fn new(schema_version: u32, payload: BTreeMap<String, String>) -> Self {
        Self {
            schema_version,
            payload,
            source_plugin_id: None,
            channel: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Accepted,
    ChannelNotFound,
    SchemaMismatch,
    PayloadInvalid,
    QuotaExceeded,
    Backpressure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResult {
    pub status: MessageStatus,
    pub delivered: usize,
    pub reason: Option<String>,
}

impl MessageResult {
    fn rejected(status: MessageStatus, reason: String) -> Self {
        Self {
            status,
            delivered: 0,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub channel: String,
    pub owner: String,
    pub schema_version: u32,
    pub in_flight: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub dropped_backpressure: u64,
    pub dropped_quota: u64,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&PluginMessage) + Send + Sync>;

struct ListenerEntry {
    id: SubscriptionId,
    plugin_id: String,
    listener: Listener,
}

struct ChannelState {
    owner: String,
    spec: ChannelSpec,
    listeners: RwLock<Vec<Arc<ListenerEntry>>>,
    in_flight: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_quota: AtomicU64,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
pub struct PluginNetworkHub {
    channels: DashMap<String, Arc<ChannelState>>,
    /// Sender quota per (plugin, channel).
    quotas: DashMap<(String, String), Arc<RateWindow>>,
    next_subscription: AtomicU64,
}

impl PluginNetworkHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view_for(self: &Arc<Self>, plugin_id: &str) -> PluginNetwork {
        PluginNetwork {
            plugin_id: plugin_id.to_string(),
            hub: Arc::clone(self),
            module: ModuleGuard::none(),
        }
    }

    /// Register a channel. Returns `false` if the id is taken.
    pub fn register_channel(&self, plugin_id: &str, spec: ChannelSpec) -> RuntimeResult<bool> {
        let id = normalize(&spec.id)?;
        if spec.schema_version == 0
            || spec.max_in_flight == 0
            || spec.max_messages_per_minute == 0
            || spec.max_payload_entries == 0
            || spec.max_payload_total_chars == 0
        {
            return Err(RuntimeError::InvalidRegistration(format!(
                "channel '{id}': schema version and limits must be greater than 0"
            )));
        }
        match self.channels.entry(id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(ChannelState {
                    owner: plugin_id.to_string(),
                    spec: ChannelSpec { id, ..spec },
                    listeners: RwLock::new(Vec::new()),
                    in_flight: AtomicUsize::new(0),
                    accepted: AtomicU64::new(0),
                    rejected: AtomicU64::new(0),
                    dropped_backpressure: AtomicU64::new(0),
                    dropped_quota: AtomicU64::new(0),
                }));
                Ok(true)
            }
        }
    }

    pub fn list_channels(&self) -> Vec<ChannelSpec> {
        let mut specs: Vec<ChannelSpec> = self.channels.iter().map(|c| c.spec.clone()).collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    /// Subscribe to an existing channel. Returns `None` for unknown channels.
    pub fn subscribe<F>(&self, plugin_id: &str, channel: &str, listener: F) -> Option<SubscriptionId>
    where
        F: Fn(&PluginMessage) + Send + Sync + 'static,
    {
        let id = normalize(channel).ok()?;
        let state = self.channels.get(&id).map(|c| Arc::clone(&c))?;
        let subscription = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        state.listeners.write().push(Arc::new(ListenerEntry {
            id: subscription,
            plugin_id: plugin_id.to_string(),
            listener: Arc::new(listener),
        }));
        Some(subscription)
    }

    pub fn unsubscribe(&self, channel: &str, subscription: SubscriptionId) -> bool {
        let Ok(id) = normalize(channel) else {
            return false;
        };
        let Some(state) = self.channels.get(&id).map(|c| Arc::clone(&c)) else {
            return false;
        };
        let mut listeners = state.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != subscription);
        listeners.len() != before
    }

    pub fn send(&self, plugin_id: &str, channel: &str, message: PluginMessage) -> MessageResult {
        let Some(state) = normalize(channel)
            .ok()
            .and_then(|id| self.channels.get(&id).map(|c| Arc::clone(&c)))
        else {
            return MessageResult::rejected(
                MessageStatus::ChannelNotFound,
                format!("Unknown channel '{channel}'"),
            );
        };
        let spec = &state.spec;

        if message.schema_version != spec.schema_version {
            state.rejected.fetch_add(1, Ordering::Relaxed);
            return MessageResult::rejected(
                MessageStatus::SchemaMismatch,
                format!(
                    "schema version {} does not match {}",
                    message.schema_version, spec.schema_version
                ),
            );
        }
        if message.payload.len() > spec.max_payload_entries {
            state.rejected.fetch_add(1, Ordering::Relaxed);
            return MessageResult::rejected(
                MessageStatus::PayloadInvalid,
                format!("payload entries exceed {}", spec.max_payload_entries),
            );
        }
        let total_chars: usize = message
            .payload
            .iter()
            .map(|(k, v)| k.chars().count() + v.chars().count())
            .sum();
        if total_chars > spec.max_payload_total_chars {
            state.rejected.fetch_add(1, Ordering::Relaxed);
            return MessageResult::rejected(
                MessageStatus::PayloadInvalid,
                format!("payload chars exceed {}", spec.max_payload_total_chars),
            );
        }

        let quota = Arc::clone(
            &self
                .quotas
                .entry((plugin_id.to_string(), spec.id.clone()))
                .or_insert_with(|| Arc::new(RateWindow::per_minute(spec.max_messages_per_minute))),
        );
        if !quota.try_acquire() {
            state.rejected.fetch_add(1, Ordering::Relaxed);
            state.dropped_quota.fetch_add(1, Ordering::Relaxed);
            return MessageResult::rejected(
                MessageStatus::QuotaExceeded,
                format!(
                    "plugin message quota exceeded ({}/min)",
                    spec.max_messages_per_minute
                ),
            );
        }

        let acquired = state
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < spec.max_in_flight).then_some(current + 1)
            })
            .is_ok();
        if !acquired {
            state.rejected.fetch_add(1, Ordering::Relaxed);
            state.dropped_backpressure.fetch_add(1, Ordering::Relaxed);
            return MessageResult::rejected(
                MessageStatus::Backpressure,
                format!("channel in-flight limit reached ({})", spec.max_in_flight),
            );
        }
        let _in_flight = InFlightGuard(&state.in_flight);

        let outbound = PluginMessage {
            channel: spec.id.clone(),
            source_plugin_id: message
                .source_plugin_id
                .or_else(|| Some(plugin_id.to_string())),
            ..message
        };
        let listeners: Vec<Arc<ListenerEntry>> = state.listeners.read().clone();
        let mut delivered = 0;
        for entry in listeners {
            match catch_unwind(AssertUnwindSafe(|| (entry.listener)(&outbound))) {
                Ok(()) => delivered += 1,
                Err(payload) => warn!(
                    plugin = %entry.plugin_id,
                    channel = %spec.id,
                    "Channel listener panicked: {}",
                    panic_message(&*payload)
                ),
            }
        }
        state.accepted.fetch_add(1, Ordering::Relaxed);

        MessageResult {
            status: MessageStatus::Accepted,
            delivered,
            reason: None,
        }
    }

    pub fn channel_stats(&self, channel: &str) -> Option<ChannelStats> {
        let id = normalize(channel).ok()?;
        let state = self.channels.get(&id)?;
        Some(ChannelStats {
            channel: state.spec.id.clone(),
            owner: state.owner.clone(),
            schema_version: state.spec.schema_version,
            in_flight: state.in_flight.load(Ordering::Acquire),
            accepted: state.accepted.load(Ordering::Relaxed),
            rejected: state.rejected.load(Ordering::Relaxed),
            dropped_backpressure: state.dropped_backpressure.load(Ordering::Relaxed),
            dropped_quota: state.dropped_quota.load(Ordering::Relaxed),
        })
    }

    /// Drop a plugin's subscriptions, quotas and the channels it owns.
    pub fn remove_plugin(&self, plugin_id: &str) {
        self.channels.retain(|_, state| state.owner != plugin_id);
        for state in self.channels.iter() {
            state.listeners.write().retain(|l| l.plugin_id != plugin_id);
        }
        self.quotas.retain(|(owner, _), _| owner != plugin_id);
    }
}

fn normalize(raw: &str) -> RuntimeResult<String> {
    let id = raw.trim().to_ascii_lowercase();
    if id.is_empty() || id.len() > 64 {
        return Err(RuntimeError::InvalidRegistration(format!(
            "channel id '{raw}' must be 1..=64 characters"
        )));
    }
    Ok(id)
}

/// A plugin's handle on the network hub.
#[derive(Clone)]
pub struct PluginNetwork {
    plugin_id: String,
    hub: Arc<PluginNetworkHub>,
    module: ModuleGuard,
}

impl PluginNetwork {
    pub fn with_module(mut self, module: ModuleGuard) -> Self {
        self.module = module;
        self
    }

    pub fn register_channel(&self, spec: ChannelSpec) -> RuntimeResult<bool> {
        self.hub.register_channel(&self.plugin_id, spec)
    }

    pub fn list_channels(&self) -> Vec<ChannelSpec> {
        self.hub.list_channels()
    }

    pub fn subscribe<F>(&self, channel: &str, listener: F) -> Option<SubscriptionId>
    where
        F: Fn(&PluginMessage) + Send + Sync + 'static,
    {
        let pinned = Pinned::new(listener, self.module.clone());
        self.hub
            .subscribe(&self.plugin_id, channel, move |message: &PluginMessage| (pinned.code())(message))
    }

    pub fn unsubscribe(&self, channel: &str, subscription: SubscriptionId) -> bool {
        self.hub.unsubscribe(channel, subscription)
    }

    pub fn send(&self, channel: &str, message: PluginMessage) -> MessageResult {
        self.hub.send(&self.plugin_id, channel, message)
    }

    pub fn channel_stats(&self, channel: &str) -> Option<ChannelStats> {
        self.hub.channel_stats(channel)
    }
}
