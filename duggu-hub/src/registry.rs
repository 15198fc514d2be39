use std::collections::HashMap;

use duggu_core::models::{ConnectionId, RoomId};
use duggu_core::Connection;
use parking_lot::Mutex;
use tracing::{debug, info};

/// One member of a chat room
#[derive(Debug, Clone)]
pub struct ChatUser {
    pub display_name: String,
    pub connection: Connection,
}

#[derive(Debug, Clone)]
pub struct ChatRoom {
    pub room_id: RoomId,
    pub members: HashMap<ConnectionId, ChatUser>,
}

impl ChatRoom {
    fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            members: HashMap::new(),
        }
    }
}

/// In-memory room membership
///
/// Every operation, reads included, runs under one mutex so a broadcast never
/// iterates a member map that is being changed.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, ChatRoom>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, creating the room on first join.
    ///
    /// Every call mints a fresh membership id, so joining twice from one socket
    /// yields two memberships.
    pub fn create_or_join(
        &self,
        room_id: RoomId,
        display_name: impl Into<String>,
        connection: Connection,
    ) -> ConnectionId {
        let connection_id = ConnectionId::new();
        let user = ChatUser {
            display_name: display_name.into(),
            connection,
        };

        let mut rooms = self.rooms.lock();
        let room = rooms.entry(room_id).or_insert_with(|| {
            info!(room_id = %room_id, "Room created");
            ChatRoom::new(room_id)
        });
        room.members.insert(connection_id.clone(), user);

        debug!(
            room_id = %room_id,
            connection_id = %connection_id,
            members = room.members.len(),
            "Member joined room"
        );

        connection_id
    }

    /// Remove the room and all of its members, returning what was removed.
    pub fn delete(&self, room_id: RoomId) -> Option<ChatRoom> {
        let removed = self.rooms.lock().remove(&room_id);
        if let Some(room) = &removed {
            info!(room_id = %room_id, members = room.members.len(), "Room deleted");
        }
        removed
    }

    /// Snapshot of the current members
    #[must_use]
    pub fn members_of(&self, room_id: RoomId) -> Vec<(ConnectionId, ChatUser)> {
        self.rooms
            .lock()
            .get(&room_id)
            .map(|room| {
                room.members
                    .iter()
                    .map(|(id, user)| (id.clone(), user.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, room_id: RoomId) -> bool {
        self.rooms.lock().contains_key(&room_id)
    }

    /// Drop one membership; the room goes with its last member.
    pub fn remove_member(&self, room_id: RoomId, connection_id: &ConnectionId) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(&room_id) else {
            return false;
        };

        let removed = room.members.remove(connection_id).is_some();
        if removed {
            debug!(room_id = %room_id, connection_id = %connection_id, "Member removed");
        }
        if room.members.is_empty() {
            rooms.remove(&room_id);
            debug!(room_id = %room_id, "Room has no more members, removed");
        }
        removed
    }

    /// Remove every member whose transport is known closed.
    pub fn prune_closed(&self, room_id: RoomId) -> usize {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(&room_id) else {
            return 0;
        };

        let before = room.members.len();
        room.members.retain(|_, user| !user.connection.is_closed());
        let pruned = before - room.members.len();

        if room.members.is_empty() {
            rooms.remove(&room_id);
        }
        if pruned > 0 {
            debug!(room_id = %room_id, pruned, "Pruned closed members");
        }
        pruned
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    #[must_use]
    pub fn member_count(&self, room_id: RoomId) -> usize {
        self.rooms
            .lock()
            .get(&room_id)
            .map_or(0, |room| room.members.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duggu_core::test_helpers::memory_connection;

    #[test]
    fn test_join_creates_then_extends_room() {
        let registry = RoomRegistry::new();
        let room = RoomId::new(7);
        let (x, _) = memory_connection();
        let (y, _) = memory_connection();

        let alice = registry.create_or_join(room, "alice", x);
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.member_count(room), 1);

        let bob = registry.create_or_join(room, "bob", y);
        assert_eq!(registry.member_count(room), 2);
        assert_ne!(alice, bob);

        let mut names: Vec<_> = registry
            .members_of(room)
            .into_iter()
            .map(|(_, user)| user.display_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[test]
    fn test_rejoin_same_socket_makes_two_memberships() {
        let registry = RoomRegistry::new();
        let (conn, _) = memory_connection();

        let first = registry.create_or_join(RoomId::new(1), "alice", conn.clone());
        let second = registry.create_or_join(RoomId::new(1), "alice", conn);
        assert_ne!(first, second);
        assert_eq!(registry.member_count(RoomId::new(1)), 2);
    }

    #[test]
    fn test_delete_removes_every_member() {
        let registry = RoomRegistry::new();
        let (a, _) = memory_connection();
        let (b, _) = memory_connection();
        registry.create_or_join(RoomId::new(3), "a", a);
        registry.create_or_join(RoomId::new(3), "b", b);

        let removed = registry.delete(RoomId::new(3)).unwrap();
        assert_eq!(removed.members.len(), 2);
        assert!(!registry.contains(RoomId::new(3)));
        assert!(registry.members_of(RoomId::new(3)).is_empty());
        assert!(registry.delete(RoomId::new(3)).is_none());
    }

    #[test]
    fn test_remove_last_member_drops_room() {
        let registry = RoomRegistry::new();
        let (a, _) = memory_connection();
        let id = registry.create_or_join(RoomId::new(5), "a", a);

        assert!(registry.remove_member(RoomId::new(5), &id));
        assert!(!registry.contains(RoomId::new(5)));
        assert!(!registry.remove_member(RoomId::new(5), &id));
    }

    #[tokio::test]
    async fn test_prune_closed_members() {
        let registry = RoomRegistry::new();
        let (open, _) = memory_connection();
        let (closed, _) = memory_connection();
        registry.create_or_join(RoomId::new(9), "open", open);
        registry.create_or_join(RoomId::new(9), "closed", closed.clone());

        closed.close().await;
        assert_eq!(registry.prune_closed(RoomId::new(9)), 1);
        assert_eq!(registry.member_count(RoomId::new(9)), 1);
    }
}
