//! Room membership.
//!
//! One `RwLock` guards both directions of the mapping, so a lookup never sees
//! an endpoint that is half-way between two rooms.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::debug;

use super::{EndpointId, RoomId};

#[derive(Debug, Default)]
struct Membership {
    rooms: HashMap<RoomId, HashSet<EndpointId>>,
    room_of: HashMap<EndpointId, RoomId>,
}

impl Membership {
    fn remove(&mut self, endpoint: EndpointId) -> Option<RoomId> {
        let room = self.room_of.remove(&endpoint)?;
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&endpoint);
            if members.is_empty() {
                self.rooms.remove(&room);
                debug!(event = "room_dropped", room = %room, "Last member left, room removed");
            }
        }
        Some(room)
    }
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    inner: RwLock<Membership>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `endpoint` to `room`. An endpoint is a member of at most one
    /// room; if it was in another one it leaves it first and that room is
    /// returned. Joining the same room again is a no-op.
    pub async fn join(&self, room: &RoomId, endpoint: EndpointId) -> Option<RoomId> {
        let mut inner = self.inner.write().await;
        let previous = match inner.room_of.get(&endpoint) {
            Some(current) if current == room => return None,
            Some(_) => inner.remove(endpoint),
            None => None,
        };
        inner
            .rooms
            .entry(room.clone())
            .or_default()
            .insert(endpoint);
        inner.room_of.insert(endpoint, room.clone());
        previous
    }

    /// Members of `room` other than `excluding`.
    pub async fn members_of(&self, room: &RoomId, excluding: EndpointId) -> Vec<EndpointId> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .copied()
                    .filter(|m| *m != excluding)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn leave(&self, endpoint: EndpointId) -> Option<RoomId> {
        self.inner.write().await.remove(endpoint)
    }

    pub async fn room_of(&self, endpoint: EndpointId) -> Option<RoomId> {
        self.inner.read().await.room_of.get(&endpoint).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    pub async fn member_count(&self, room: &RoomId) -> usize {
        self.inner
            .read()
            .await
            .rooms
            .get(room)
            .map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str) -> RoomId {
        RoomId::new(id).unwrap()
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let registry = RoomRegistry::new();
        let a = EndpointId::new();
        assert_eq!(registry.join(&room("42"), a).await, None);
        assert_eq!(registry.join(&room("42"), a).await, None);
        assert_eq!(registry.member_count(&room("42")).await, 1);
    }

    #[tokio::test]
    async fn members_exclude_the_caller() {
        let registry = RoomRegistry::new();
        let (a, b) = (EndpointId::new(), EndpointId::new());
        registry.join(&room("42"), a).await;
        registry.join(&room("42"), b).await;

        assert_eq!(registry.members_of(&room("42"), a).await, vec![b]);
        assert_eq!(registry.members_of(&room("42"), b).await, vec![a]);
        assert!(registry.members_of(&room("7"), a).await.is_empty());
    }

    #[tokio::test]
    async fn leaving_drops_empty_rooms() {
        let registry = RoomRegistry::new();
        let (a, b) = (EndpointId::new(), EndpointId::new());
        registry.join(&room("42"), a).await;
        registry.join(&room("42"), b).await;

        assert_eq!(registry.leave(a).await, Some(room("42")));
        assert!(registry.members_of(&room("42"), b).await.is_empty());
        assert_eq!(registry.room_count().await, 1);

        assert_eq!(registry.leave(b).await, Some(room("42")));
        assert_eq!(registry.room_count().await, 0);
        assert_eq!(registry.leave(b).await, None);
    }

    #[tokio::test]
    async fn joining_another_room_leaves_the_first() {
        let registry = RoomRegistry::new();
        let (a, b) = (EndpointId::new(), EndpointId::new());
        registry.join(&room("1"), a).await;
        registry.join(&room("1"), b).await;

        assert_eq!(registry.join(&room("2"), a).await, Some(room("1")));
        assert_eq!(registry.room_of(a).await, Some(room("2")));
        assert!(registry.members_of(&room("1"), b).await.is_empty());
        assert_eq!(registry.member_count(&room("2")).await, 1);
    }
}
