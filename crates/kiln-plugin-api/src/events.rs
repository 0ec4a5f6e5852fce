//! Typed, runtime-wide event bus.
//!
//! Subscribers are keyed by the event's `TypeId`. Publishing clones the
//! subscriber list out of the map and calls handlers without holding a
//! shard lock, so handlers may subscribe or publish themselves.

use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

use crate::module::{ModuleGuard, Pinned};
use crate::plugin::panic_message;

type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    owner: String,
    handler: Handler,
}

/// Published by the runtime after a plugin's `on_enable` succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEnabled {
    pub id: String,
    pub version: String,
}

/// Published by the runtime after a plugin was unloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDisabled {
    pub id: String,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<TypeId, Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<E, F>(&self, owner: &str, handler: F)
    where
        E: Any,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(event);
            }
        });
        self.subscribers
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Subscriber {
                owner: owner.to_string(),
                handler,
            });
    }

    /// Deliver `event` to every subscriber. Returns how many were called.
    /// A panicking handler is logged and does not stop delivery.
    pub fn publish<E: Any>(&self, event: &E) -> usize {
        let subscribers = match self.subscribers.get(&TypeId::of::<E>()) {
            Some(list) => list.clone(),
            None => return 0,
        };
        let event: &dyn Any = event;
        for subscriber in &subscribers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event))) {
                warn!(
                    plugin = %subscriber.owner,
                    "Event handler panicked: {}",
                    panic_message(&*payload)
                );
            }
        }
        subscribers.len()
    }

    pub fn subscriber_count<E: Any>(&self) -> usize {
        self.subscribers
            .get(&TypeId::of::<E>())
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Drop every subscription owned by `owner`.
    pub fn remove_plugin(&self, owner: &str) {
        for mut entry in self.subscribers.iter_mut() {
            entry.value_mut().retain(|s| s.owner != owner);
        }
        self.subscribers.retain(|_, list| !list.is_empty());
    }
}

/// A plugin's handle on the event bus.
#[derive(Clone)]
pub struct PluginEvents {
    plugin_id: String,
    bus: Arc<EventBus>,
    module: ModuleGuard,
}

impl PluginEvents {
    pub fn new(plugin_id: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            bus,
            module: ModuleGuard::none(),
        }
    }

    pub fn with_module(mut self, module: ModuleGuard) -> Self {
        self.module = module;
        self
    }

    pub fn subscribe<E, F>(&self, handler: F)
    where
        E: Any,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let pinned = Pinned::new(handler, self.module.clone());
        self.bus
            .subscribe(&self.plugin_id, move |event: &E| (pinned.code())(event));
    }

    pub fn publish<E: Any>(&self, event: &E) -> usize {
        self.bus.publish(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct BlockBroken {
        x: i32,
    }

    #[test]
    fn test_typed_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        bus.subscribe::<BlockBroken, _>("miner", move |e| {
            s.fetch_add(e.x as usize, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&BlockBroken { x: 5 }), 1);
        assert_eq!(bus.publish(&PluginDisabled { id: "x".into() }), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe::<BlockBroken, _>("bad", |_| panic!("handler bug"));
        let s = Arc::clone(&seen);
        bus.subscribe::<BlockBroken, _>("good", move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&BlockBroken { x: 1 }), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_plugin() {
        let bus = Arc::new(EventBus::new());
        let events = PluginEvents::new("miner", Arc::clone(&bus));
        events.subscribe::<BlockBroken, _>(|_| {});
        bus.subscribe::<BlockBroken, _>("other", |_| {});

        bus.remove_plugin("miner");
        assert_eq!(bus.subscriber_count::<BlockBroken>(), 1);
    }
}
