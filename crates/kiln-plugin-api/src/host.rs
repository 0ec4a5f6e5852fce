//! Host access exposed to plugins.
//!
//! [`HostAccess`] is the seam between the runtime and whatever process is
//! embedding it. Every method has a default body that reports "unavailable",
//! so a host only implements what it actually supports. Plugins never see
//! the host directly: they get a [`ScopedHostAccess`] that checks the
//! plugin's declared permissions before delegating.

use kiln_runtime::{HostPermission, PermissionSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub online_players: usize,
    pub max_players: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub name: String,
    pub time: u64,
    pub weather: String,
    pub entity_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub uuid: String,
    pub entity_type: String,
    pub location: Location,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub uuid: String,
    pub name: String,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub item: String,
    pub amount: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub owner: String,
    pub size: usize,
    pub slots: BTreeMap<usize, ItemStack>,
}

/// Operations the embedding host can offer.
pub trait HostAccess: Send + Sync {
    fn server_info(&self) -> Option<ServerInfo> {
        None
    }

    fn broadcast(&self, _message: &str) -> bool {
        false
    }

    fn worlds(&self) -> Vec<WorldSnapshot> {
        Vec::new()
    }

    fn create_world(&self, _name: &str, _seed: i64) -> Option<WorldSnapshot> {
        None
    }

    fn set_world_time(&self, _world: &str, _time: u64) -> bool {
        false
    }

    fn world_data(&self, _world: &str, _key: &str) -> Option<String> {
        None
    }

    fn set_world_data(&self, _world: &str, _key: &str, _value: &str) -> bool {
        false
    }

    fn world_weather(&self, _world: &str) -> Option<String> {
        None
    }

    fn set_world_weather(&self, _world: &str, _weather: &str) -> bool {
        false
    }

    fn entities(&self, _world: &str) -> Vec<EntitySnapshot> {
        Vec::new()
    }

    fn spawn_entity(&self, _entity_type: &str, _location: &Location) -> Option<EntitySnapshot> {
        None
    }

    fn remove_entity(&self, _uuid: &str) -> bool {
        false
    }

    fn entity_data(&self, _uuid: &str, _key: &str) -> Option<String> {
        None
    }

    fn set_entity_data(&self, _uuid: &str, _key: &str, _value: &str) -> bool {
        false
    }

    fn inventory(&self, _owner: &str) -> Option<InventorySnapshot> {
        None
    }

    fn set_inventory_item(&self, _owner: &str, _slot: usize, _item: Option<ItemStack>) -> bool {
        false
    }

    fn players(&self) -> Vec<PlayerSnapshot> {
        Vec::new()
    }

    fn send_message(&self, _player: &str, _message: &str) -> bool {
        false
    }

    fn kick_player(&self, _player: &str, _reason: &str) -> bool {
        false
    }

    fn move_player(&self, _player: &str, _location: &Location) -> bool {
        false
    }
}

/// A host with nothing to offer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl HostAccess for NoopHost {}

/// Permission-checked view of the host for one plugin.
pub struct ScopedHostAccess {
    plugin_id: String,
    permissions: PermissionSet,
    delegate: Arc<dyn HostAccess>,
    denials: AtomicU64,
}

impl ScopedHostAccess {
    pub fn new(plugin_id: impl Into<String>, permissions: PermissionSet, delegate: Arc<dyn HostAccess>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            permissions,
            delegate,
            denials: AtomicU64::new(0),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn has_permission(&self, permission: &HostPermission) -> bool {
        self.permissions.has(permission)
    }

    /// Host calls refused so far.
    pub fn denials(&self) -> u64 {
        self.denials.load(Ordering::Relaxed)
    }

    fn allowed(&self, permission: HostPermission, operation: &str) -> bool {
        if crate::adapter::invocation_expired() {
            self.denials.fetch_add(1, Ordering::Relaxed);
            warn!(
                plugin = %self.plugin_id,
                operation,
                "Host access refused to a timed-out adapter invocation"
            );
            return false;
        }
        if self.permissions.has(&permission) {
            return true;
        }
        self.denials.fetch_add(1, Ordering::Relaxed);
        warn!(
            plugin = %self.plugin_id,
            permission = %permission,
            operation,
            "Host access denied"
        );
        false
    }
}

impl HostAccess for ScopedHostAccess {
    fn server_info(&self) -> Option<ServerInfo> {
        if !self.allowed(HostPermission::ServerRead, "server_info") {
            return None;
        }
        self.delegate.server_info()
    }

    fn broadcast(&self, message: &str) -> bool {
        self.allowed(HostPermission::ServerBroadcast, "broadcast") && self.delegate.broadcast(message)
    }

    fn worlds(&self) -> Vec<WorldSnapshot> {
        if !self.allowed(HostPermission::WorldRead, "worlds") {
            return Vec::new();
        }
        self.delegate.worlds()
    }

    fn create_world(&self, name: &str, seed: i64) -> Option<WorldSnapshot> {
        if !self.allowed(HostPermission::WorldWrite, "create_world") {
            return None;
        }
        self.delegate.create_world(name, seed)
    }

    fn set_world_time(&self, world: &str, time: u64) -> bool {
        self.allowed(HostPermission::WorldWrite, "set_world_time")
            && self.delegate.set_world_time(world, time)
    }

    fn world_data(&self, world: &str, key: &str) -> Option<String> {
        if !self.allowed(HostPermission::WorldDataRead, "world_data") {
            return None;
        }
        self.delegate.world_data(world, key)
    }

    fn set_world_data(&self, world: &str, key: &str, value: &str) -> bool {
        self.allowed(HostPermission::WorldDataWrite, "set_world_data")
            && self.delegate.set_world_data(world, key, value)
    }

    fn world_weather(&self, world: &str) -> Option<String> {
        if !self.allowed(HostPermission::WorldWeatherRead, "world_weather") {
            return None;
        }
        self.delegate.world_weather(world)
    }

    fn set_world_weather(&self, world: &str, weather: &str) -> bool {
        self.allowed(HostPermission::WorldWeatherWrite, "set_world_weather")
            && self.delegate.set_world_weather(world, weather)
    }

    fn entities(&self, world: &str) -> Vec<EntitySnapshot> {
        if !self.allowed(HostPermission::EntityRead, "entities") {
            return Vec::new();
        }
        self.delegate.entities(world)
    }

    fn spawn_entity(&self, entity_type: &str, location: &Location) -> Option<EntitySnapshot> {
        if !self.allowed(HostPermission::EntitySpawn, "spawn_entity") {
            return None;
        }
        self.delegate.spawn_entity(entity_type, location)
    }

    fn remove_entity(&self, uuid: &str) -> bool {
        self.allowed(HostPermission::EntityRemove, "remove_entity") && self.delegate.remove_entity(uuid)
    }

    fn entity_data(&self, uuid: &str, key: &str) -> Option<String> {
        if !self.allowed(HostPermission::EntityDataRead, "entity_data") {
            return None;
        }
        self.delegate.entity_data(uuid, key)
    }

    fn set_entity_data(&self, uuid: &str, key: &str, value: &str) -> bool {
        self.allowed(HostPermission::EntityDataWrite, "set_entity_data")
            && self.delegate.set_entity_data(uuid, key, value)
    }

    fn inventory(&self, owner: &str) -> Option<InventorySnapshot> {
        if !self.allowed(HostPermission::InventoryRead, "inventory") {
            return None;
        }
        self.delegate.inventory(owner)
    }

    fn set_inventory_item(&self, owner: &str, slot: usize, item: Option<ItemStack>) -> bool {
        self.allowed(HostPermission::InventoryWrite, "set_inventory_item")
            && self.delegate.set_inventory_item(owner, slot, item)
    }

    fn players(&self) -> Vec<PlayerSnapshot> {
        if !self.allowed(HostPermission::PlayerRead, "players") {
            return Vec::new();
        }
        self.delegate.players()
    }

    fn send_message(&self, player: &str, message: &str) -> bool {
        self.allowed(HostPermission::PlayerMessage, "send_message")
            && self.delegate.send_message(player, message)
    }

    fn kick_player(&self, player: &str, reason: &str) -> bool {
        self.allowed(HostPermission::PlayerKick, "kick_player") && self.delegate.kick_player(player, reason)
    }

    fn move_player(&self, player: &str, location: &Location) -> bool {
        self.allowed(HostPermission::PlayerMove, "move_player")
            && self.delegate.move_player(player, location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standalone::StandaloneHost;

    #[test]
    fn test_noop_host_reports_unavailable() {
        let host = NoopHost;
        assert!(host.server_info().is_none());
        assert!(!host.broadcast("hi"));
        assert!(host.worlds().is_empty());
    }

    #[test]
    fn test_scoped_access_checks_permissions() {
        let backend = Arc::new(StandaloneHost::new());
        backend.create_world("overworld", 1);

        let scoped = ScopedHostAccess::new(
            "reader",
            PermissionSet::from_strings(["host.world.read"]),
            backend.clone(),
        );

        assert_eq!(scoped.worlds().len(), 1);
        assert!(!scoped.set_world_time("overworld", 6000));
        assert!(!scoped.set_world_data("overworld", "k", "v"));
        assert_eq!(scoped.denials(), 2);

        assert_eq!(backend.worlds()[0].time, 0);
        assert_eq!(backend.world_data("overworld", "k"), None);
    }

    #[test]
    fn test_write_does_not_imply_read() {
        let backend = Arc::new(StandaloneHost::new());
        let scoped = ScopedHostAccess::new(
            "writer",
            PermissionSet::from_strings(["HOST.WORLD.WRITE"]),
            backend,
        );

        assert!(scoped.create_world("nether", 7).is_some());
        assert!(scoped.worlds().is_empty());
        assert_eq!(scoped.denials(), 1);
    }
}
