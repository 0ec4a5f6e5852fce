//! In-memory host for tools, tests and the daemon.
//!
//! Keeps worlds, entities, players and inventories in plain maps behind one
//! lock. No simulation happens: state only changes when something calls a
//! mutating [`HostAccess`] method.

use crate::host::{
    EntitySnapshot, HostAccess, InventorySnapshot, ItemStack, Location, PlayerSnapshot, ServerInfo,
    WorldSnapshot,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

const INVENTORY_SIZE: usize = 36;
const DEFAULT_WEATHER: &str = "clear";

#[derive(Debug, Default)]
struct WorldState {
    time: u64,
    weather: String,
    data: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct HostState {
    worlds: BTreeMap<String, WorldState>,
    entities: BTreeMap<String, EntitySnapshot>,
    players: BTreeMap<String, PlayerSnapshot>,
    inventories: HashMap<String, BTreeMap<usize, ItemStack>>,
    broadcasts: Vec<String>,
    messages: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct StandaloneHost {
    name: String,
    version: String,
    max_players: usize,
    state: RwLock<HostState>,
}

impl Default for StandaloneHost {
    fn default() -> Self {
        Self::new()
    }
}

impl StandaloneHost {
    pub fn new() -> Self {
        Self {
            name: "kiln-standalone".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_players: 20,
            state: RwLock::new(HostState::default()),
        }
    }

    /// Add an online player. Returns the player's uuid.
    pub fn join_player(&self, name: &str, location: Location) -> String {
        let uuid = Uuid::new_v4().to_string();
        let mut state = self.state.write();
        state.players.insert(
            name.to_string(),
            PlayerSnapshot {
                uuid: uuid.clone(),
                name: name.to_string(),
                location,
            },
        );
        state.inventories.entry(name.to_string()).or_default();
        uuid
    }

    /// Messages broadcast so far.
    pub fn broadcasts(&self) -> Vec<String> {
        self.state.read().broadcasts.clone()
    }

    /// `(player, message)` pairs sent so far.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.state.read().messages.clone()
    }

    fn world_snapshot(state: &HostState, name: &str, world: &WorldState) -> WorldSnapshot {
        WorldSnapshot {
            name: name.to_string(),
            time: world.time,
            weather: world.weather.clone(),
            entity_count: state
                .entities
                .values()
                .filter(|e| e.location.world == name)
                .count(),
        }
    }
}

impl HostAccess for StandaloneHost {
    fn server_info(&self) -> Option<ServerInfo> {
        let state = self.state.read();
        Some(ServerInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            online_players: state.players.len(),
            max_players: self.max_players,
        })
    }

    fn broadcast(&self, message: &str) -> bool {
        self.state.write().broadcasts.push(message.to_string());
        true
    }

    fn worlds(&self) -> Vec<WorldSnapshot> {
        let state = self.state.read();
        state
            .worlds
            .iter()
            .map(|(name, world)| Self::world_snapshot(&state, name, world))
            .collect()
    }

    fn create_world(&self, name: &str, _seed: i64) -> Option<WorldSnapshot> {
        if name.trim().is_empty() {
            return None;
        }
        let mut state = self.state.write();
        state.worlds.entry(name.to_string()).or_insert_with(|| WorldState {
            weather: DEFAULT_WEATHER.to_string(),
            ..WorldState::default()
        });
        let world = state.worlds.get(name)?;
        Some(Self::world_snapshot(&state, name, world))
    }

    fn set_world_time(&self, world: &str, time: u64) -> bool {
        match self.state.write().worlds.get_mut(world) {
            Some(w) => {
                w.time = time;
                true
            }
            None => false,
        }
    }

    fn world_data(&self, world: &str, key: &str) -> Option<String> {
        self.state.read().worlds.get(world)?.data.get(key).cloned()
    }

    fn set_world_data(&self, world: &str, key: &str, value: &str) -> bool {
        match self.state.write().worlds.get_mut(world) {
            Some(w) => {
                w.data.insert(key.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    fn world_weather(&self, world: &str) -> Option<String> {
        self.state.read().worlds.get(world).map(|w| w.weather.clone())
    }

    fn set_world_weather(&self, world: &str, weather: &str) -> bool {
        match self.state.write().worlds.get_mut(world) {
            Some(w) => {
                w.weather = weather.to_string();
                true
            }
            None => false,
        }
    }

    fn entities(&self, world: &str) -> Vec<EntitySnapshot> {
        self.state
            .read()
            .entities
            .values()
            .filter(|e| e.location.world == world)
            .cloned()
            .collect()
    }

    fn spawn_entity(&self, entity_type: &str, location: &Location) -> Option<EntitySnapshot> {
        let mut state = self.state.write();
        if !state.worlds.contains_key(&location.world) {
            return None;
        }
        let entity = EntitySnapshot {
            uuid: Uuid::new_v4().to_string(),
            entity_type: entity_type.to_string(),
            location: location.clone(),
            data: BTreeMap::new(),
        };
        state.entities.insert(entity.uuid.clone(), entity.clone());
        Some(entity)
    }

    fn remove_entity(&self, uuid: &str) -> bool {
        self.state.write().entities.remove(uuid).is_some()
    }

    fn entity_data(&self, uuid: &str, key: &str) -> Option<String> {
        self.state.read().entities.get(uuid)?.data.get(key).cloned()
    }

    fn set_entity_data(&self, uuid: &str, key: &str, value: &str) -> bool {
        match self.state.write().entities.get_mut(uuid) {
            Some(entity) => {
                entity.data.insert(key.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    fn inventory(&self, owner: &str) -> Option<InventorySnapshot> {
        let state = self.state.read();
        state.inventories.get(owner).map(|slots| InventorySnapshot {
            owner: owner.to_string(),
            size: INVENTORY_SIZE,
            slots: slots.clone(),
        })
    }

    fn set_inventory_item(&self, owner: &str, slot: usize, item: Option<ItemStack>) -> bool {
        if slot >= INVENTORY_SIZE {
            return false;
        }
        let mut state = self.state.write();
        let Some(slots) = state.inventories.get_mut(owner) else {
            return false;
        };
        match item {
            Some(stack) if stack.amount > 0 => {
                slots.insert(slot, stack);
            }
            _ => {
                slots.remove(&slot);
            }
        }
        true
    }

    fn players(&self) -> Vec<PlayerSnapshot> {
        self.state.read().players.values().cloned().collect()
    }

    fn send_message(&self, player: &str, message: &str) -> bool {
        let mut state = self.state.write();
        if !state.players.contains_key(player) {
            return false;
        }
        state.messages.push((player.to_string(), message.to_string()));
        true
    }

    fn kick_player(&self, player: &str, _reason: &str) -> bool {
        self.state.write().players.remove(player).is_some()
    }

    fn move_player(&self, player: &str, location: &Location) -> bool {
        let mut state = self.state.write();
        if !state.worlds.contains_key(&location.world) {
            return false;
        }
        match state.players.get_mut(player) {
            Some(p) => {
                p.location = location.clone();
                true
            }
            None => false,
        }
    }
}
