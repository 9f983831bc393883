//! Room registry: rooms, their members and moderator, and who is currently
//! connected to each room's mesh.
//!
//! Every mutation saves the whole room table through the document store
//! while the table lock is still held. A failed save is logged; the
//! in-memory change stands.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use chatmesh_store::{load_typed, save_typed, DocumentStore};

use crate::error::{RegistryError, RegistryResult};
use crate::presence::is_expired;

pub const ROOMS_DOCUMENT: &str = "rooms";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub moderator: String,
    pub members: BTreeSet<String>,
    #[serde(rename = "in-room", default)]
    pub in_room: BTreeSet<String>,
    #[serde(rename = "mod-last-seen")]
    pub moderator_last_seen: DateTime<Utc>,
}

impl Room {
    fn new(moderator: &str, now: DateTime<Utc>) -> Self {
        Self {
            moderator: moderator.to_string(),
            members: BTreeSet::from([moderator.to_string()]),
            in_room: BTreeSet::new(),
            moderator_last_seen: now,
        }
    }

    fn ensure_moderator(&self, room: &str, user: &str) -> RegistryResult<()> {
        if self.moderator == user {
            Ok(())
        } else {
            Err(RegistryError::Permission(format!(
                "Only the moderator of '{room}' can do that"
            )))
        }
    }

    /// in-room ⊆ members and moderator ∈ members.
    pub fn is_consistent(&self) -> bool {
        self.members.contains(&self.moderator) && self.in_room.is_subset(&self.members)
    }
}

/// Outcome of a remove-member call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotAMember,
}

pub struct RoomRegistry {
    rooms: Mutex<BTreeMap<String, Room>>,
    store: Arc<dyn DocumentStore>,
}

impl RoomRegistry {
    /// Load the persisted room table. Nobody is connected to a tracker that
    /// just started, so every in-room set begins empty.
    pub fn load(store: Arc<dyn DocumentStore>) -> Self {
        let mut rooms: BTreeMap<String, Room> = match load_typed(store.as_ref(), ROOMS_DOCUMENT) {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!(error = %e, "Failed to load rooms, starting empty");
                BTreeMap::new()
            }
        };
        for room in rooms.values_mut() {
            room.in_room.clear();
        }
        info!(rooms = rooms.len(), "Room registry loaded");

        Self {
            rooms: Mutex::new(rooms),
            store,
        }
    }

    fn persist(&self, rooms: &BTreeMap<String, Room>) {
        if let Err(e) = save_typed(self.store.as_ref(), ROOMS_DOCUMENT, rooms) {
            warn!(error = %e, "Failed to persist room table");
        }
    }

    pub async fn list_rooms(&self) -> Vec<String> {
        self.rooms.lock().await.keys().cloned().collect()
    }

    pub async fn create_room(&self, name: &str, creator: &str) -> RegistryResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::InvalidInput("Room name must not be empty".into()));
        }

        let mut rooms = self.rooms.lock().await;
        if rooms.contains_key(name) {
            return Err(RegistryError::Conflict(format!("Room '{name}' already exists")));
        }
        rooms.insert(name.to_string(), Room::new(creator, Utc::now()));
        self.persist(&rooms);
        info!(room = %name, moderator = %creator, "Room created");
        Ok(())
    }

    /// Put `user` in the room's in-room set. The user must already be a
    /// member. Joining twice is fine.
    pub async fn join_room(&self, name: &str, user: &str) -> RegistryResult<()> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(name)
            .ok_or_else(|| RegistryError::room_not_found(name))?;
        if !room.members.contains(user) {
            return Err(RegistryError::Permission(format!(
                "You are not a member of '{name}'"
            )));
        }
        if room.in_room.insert(user.to_string()) {
            self.persist(&rooms);
        }
        Ok(())
    }

    pub async fn leave_room(&self, name: &str, user: &str) {
        let mut rooms = self.rooms.lock().await;
        let changed = rooms
            .get_mut(name)
            .is_some_and(|room| room.in_room.remove(user));
        if changed {
            self.persist(&rooms);
        }
    }

    /// Disconnect cleanup: drop `user` from every in-room set.
    pub async fn remove_user_from_all_rooms(&self, user: &str) {
        let mut rooms = self.rooms.lock().await;
        let mut changed = false;
        for room in rooms.values_mut() {
            changed |= room.in_room.remove(user);
        }
        if changed {
            self.persist(&rooms);
        }
    }

    /// Users currently connected to the room's mesh, minus `excluding`.
    pub async fn online_members(&self, name: &str, excluding: &str) -> RegistryResult<Vec<String>> {
        let rooms = self.rooms.lock().await;
        let room = rooms.get(name).ok_or_else(|| RegistryError::room_not_found(name))?;
        Ok(room
            .in_room
            .iter()
            .filter(|u| u.as_str() != excluding)
            .cloned()
            .collect())
    }

    pub async fn add_member(&self, name: &str, user: &str, by: &str) -> RegistryResult<()> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(name)
            .ok_or_else(|| RegistryError::room_not_found(name))?;
        room.ensure_moderator(name, by)?;
        if !room.members.insert(user.to_string()) {
            return Err(RegistryError::Conflict(format!(
                "'{user}' is already a member of '{name}'"
            )));
        }
        self.persist(&rooms);
        info!(room = %name, user = %user, "Member added");
        Ok(())
    }

    pub async fn remove_member(&self, name: &str, user: &str, by: &str) -> RegistryResult<Removal> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(name)
            .ok_or_else(|| RegistryError::room_not_found(name))?;
        room.ensure_moderator(name, by)?;
        if user == room.moderator {
            return Err(RegistryError::Permission(
                "The moderator cannot be removed from the room".into(),
            ));
        }
        if !room.members.remove(user) {
            return Ok(Removal::NotAMember);
        }
        room.in_room.remove(user);
        self.persist(&rooms);
        info!(room = %name, user = %user, "Member removed");
        Ok(Removal::Removed)
    }

    /// Moderator and sorted member list.
    pub async fn list_members(&self, name: &str) -> RegistryResult<(String, Vec<String>)> {
        let rooms = self.rooms.lock().await;
        let room = rooms.get(name).ok_or_else(|| RegistryError::room_not_found(name))?;
        Ok((room.moderator.clone(), room.members.iter().cloned().collect()))
    }

    /// Rooms `user` moderates.
    pub async fn list_my_rooms(&self, user: &str) -> Vec<String> {
        self.rooms
            .lock()
            .await
            .iter()
            .filter(|(_, room)| room.moderator == user)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub async fn close_room(&self, name: &str, by: &str) -> RegistryResult<()> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.get(name).ok_or_else(|| RegistryError::room_not_found(name))?;
        room.ensure_moderator(name, by)?;
        rooms.remove(name);
        self.persist(&rooms);
        info!(room = %name, "Room closed by moderator");
        Ok(())
    }

    pub async fn update_moderator_heartbeat(&self, user: &str, now: DateTime<Utc>) {
        let mut rooms = self.rooms.lock().await;
        let mut changed = false;
        for room in rooms.values_mut().filter(|r| r.moderator == user) {
            room.moderator_last_seen = now;
            changed = true;
        }
        if changed {
            self.persist(&rooms);
        }
    }

    /// Delete every room whose moderator has been silent for longer than
    /// `timeout`. Returns the closed room names.
    pub async fn close_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let mut rooms = self.rooms.lock().await;
        let stale: Vec<String> = rooms
            .iter()
            .filter(|(_, room)| is_expired(room.moderator_last_seen, now, timeout))
            .map(|(name, _)| name.clone())
            .collect();
        if stale.is_empty() {
            return stale;
        }
        for name in &stale {
            rooms.remove(name);
        }
        self.persist(&rooms);
        stale
    }

    pub async fn room(&self, name: &str) -> Option<Room> {
        self.rooms.lock().await.get(name).cloned()
    }
}
