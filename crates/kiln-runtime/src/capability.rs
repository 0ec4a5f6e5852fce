//! Permission tokens granted to plugins.
//!
//! Plugins list the permission tokens they need in their manifest. Membership
//! is a flat, case-insensitive set lookup: there is no hierarchy between
//! tokens, so `host.world.write` does not imply `host.world.read`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A host permission token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum HostPermission {
    ServerRead,
    ServerBroadcast,
    WorldRead,
    WorldWrite,
    WorldDataRead,
    WorldDataWrite,
    WorldWeatherRead,
    WorldWeatherWrite,
    EntityRead,
    EntitySpawn,
    EntityRemove,
    EntityDataRead,
    EntityDataWrite,
    InventoryRead,
    InventoryWrite,
    PlayerRead,
    PlayerMessage,
    PlayerKick,
    PlayerMove,

    /// Any token the host does not define itself (adapter capabilities, etc.).
    Custom(String),
}

impl HostPermission {
    /// Every token the host defines.
    pub const ALL: [HostPermission; 19] = [
        HostPermission::ServerRead,
        HostPermission::ServerBroadcast,
        HostPermission::WorldRead,
        HostPermission::WorldWrite,
        HostPermission::WorldDataRead,
        HostPermission::WorldDataWrite,
        HostPermission::WorldWeatherRead,
        HostPermission::WorldWeatherWrite,
        HostPermission::EntityRead,
        HostPermission::EntitySpawn,
        HostPermission::EntityRemove,
        HostPermission::EntityDataRead,
        HostPermission::EntityDataWrite,
        HostPermission::InventoryRead,
        HostPermission::InventoryWrite,
        HostPermission::PlayerRead,
        HostPermission::PlayerMessage,
        HostPermission::PlayerKick,
        HostPermission::PlayerMove,
    ];

    /// Parse a permission from a string. Matching is case-insensitive.
    pub fn parse(s: &str) -> Self {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "host.server.read" => HostPermission::ServerRead,
            "host.server.broadcast" => HostPermission::ServerBroadcast,
            "host.world.read" => HostPermission::WorldRead,
            "host.world.write" => HostPermission::WorldWrite,
            "host.world.data.read" => HostPermission::WorldDataRead,
            "host.world.data.write" => HostPermission::WorldDataWrite,
            "host.world.weather.read" => HostPermission::WorldWeatherRead,
            "host.world.weather.write" => HostPermission::WorldWeatherWrite,
            "host.entity.read" => HostPermission::EntityRead,
            "host.entity.spawn" => HostPermission::EntitySpawn,
            "host.entity.remove" => HostPermission::EntityRemove,
            "host.entity.data.read" => HostPermission::EntityDataRead,
            "host.entity.data.write" => HostPermission::EntityDataWrite,
            "host.inventory.read" => HostPermission::InventoryRead,
            "host.inventory.write" => HostPermission::InventoryWrite,
            "host.player.read" => HostPermission::PlayerRead,
            "host.player.message" => HostPermission::PlayerMessage,
            "host.player.kick" => HostPermission::PlayerKick,
            "host.player.move" => HostPermission::PlayerMove,
            _ => HostPermission::Custom(lowered),
        }
    }

    /// Convert permission to its token string.
    pub fn as_str(&self) -> &str {
        match self {
            HostPermission::ServerRead => "host.server.read",
            HostPermission::ServerBroadcast => "host.server.broadcast",
            HostPermission::WorldRead => "host.world.read",
            HostPermission::WorldWrite => "host.world.write",
            HostPermission::WorldDataRead => "host.world.data.read",
            HostPermission::WorldDataWrite => "host.world.data.write",
            HostPermission::WorldWeatherRead => "host.world.weather.read",
            HostPermission::WorldWeatherWrite => "host.world.weather.write",
            HostPermission::EntityRead => "host.entity.read",
            HostPermission::EntitySpawn => "host.entity.spawn",
            HostPermission::EntityRemove => "host.entity.remove",
            HostPermission::EntityDataRead => "host.entity.data.read",
            HostPermission::EntityDataWrite => "host.entity.data.write",
            HostPermission::InventoryRead => "host.inventory.read",
            HostPermission::InventoryWrite => "host.inventory.write",
            HostPermission::PlayerRead => "host.player.read",
            HostPermission::PlayerMessage => "host.player.message",
            HostPermission::PlayerKick => "host.player.kick",
            HostPermission::PlayerMove => "host.player.move",
            HostPermission::Custom(s) => s,
        }
    }
}

impl fmt::Display for HostPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for HostPermission {
    fn from(value: String) -> Self {
        HostPermission::parse(&value)
    }
}

impl From<HostPermission> for String {
    fn from(value: HostPermission) -> Self {
        value.as_str().to_string()
    }
}

/// A set of permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    permissions: HashSet<HostPermission>,
}

impl PermissionSet {
    /// Create an empty permission set.
    pub fn new() -> Self {
        Self {
            permissions: HashSet::new(),
        }
    }

    /// Create a permission set from a list of permission strings.
    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let permissions = strings
            .into_iter()
            .map(|s| HostPermission::parse(s.as_ref()))
            .collect();
        Self { permissions }
    }

    /// Add a permission to the set.
    pub fn add(&mut self, permission: HostPermission) {
        self.permissions.insert(permission);
    }

    /// Check if the set contains a permission.
    pub fn has(&self, permission: &HostPermission) -> bool {
        self.permissions.contains(permission)
    }

    /// Check membership of a raw token (case-insensitive).
    pub fn has_token(&self, token: &str) -> bool {
        self.has(&HostPermission::parse(token))
    }

    /// Get all permissions in the set.
    pub fn iter(&self) -> impl Iterator<Item = &HostPermission> {
        self.permissions.iter()
    }

    /// Get the number of permissions.
    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

impl FromIterator<HostPermission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = HostPermission>>(iter: T) -> Self {
        Self {
            permissions: iter.into_iter().collect(),
        }
    }
}
