use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

use super::events::Presence;

/// Capacity of a connection's outbound frame queue. A connection that falls
/// this far behind is treated as dead and pruned during fan-out.
pub const OUTBOUND_BUFFER: usize = 256;

/// Sending half of a connection, as registered in a room. The registry owns
/// the only long-lived clone of the sender, so pruning a connection closes
/// its queue and lets the session loop observe the disconnect.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    tx: mpsc::Sender<String>,
}

impl ConnectionHandle {
    pub fn new(id: Uuid, tx: mpsc::Sender<String>) -> Self {
        Self { id, tx }
    }

    /// Convenience constructor: a handle plus the receiving half its session
    /// (or test) drains.
    pub fn channel(id: Uuid) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (Self { id, tx }, rx)
    }
}

struct Member {
    handle: ConnectionHandle,
    presence: Option<Presence>,
}

/// In-memory mapping of project room → live connections.
///
/// Keyed by project id on a sharded concurrent map, so membership mutations
/// and fan-out for unrelated rooms never contend on one lock. No
/// persistence: state is lost on restart and clients rejoin on reconnect.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<Uuid, HashMap<Uuid, Member>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection in a room. Returns true when this join created
    /// the room.
    pub fn join(&self, room: Uuid, handle: ConnectionHandle) -> bool {
        let mut created = false;
        let mut members = self.rooms.entry(room).or_insert_with(|| {
            created = true;
            HashMap::new()
        });
        members.insert(
            handle.id,
            Member {
                handle,
                presence: None,
            },
        );
        created
    }

    /// Remove a connection from a room. Idempotent: leaving twice, or leaving
    /// a room never joined, is a no-op. Returns true when the room became
    /// empty and was dropped.
    pub fn leave(&self, room: Uuid, connection_id: Uuid) -> bool {
        let emptied = match self.rooms.get_mut(&room) {
            Some(mut members) => {
                members.remove(&connection_id);
                members.is_empty()
            }
            None => return false,
        };
        if emptied {
            return self
                .rooms
                .remove_if(&room, |_, members| members.is_empty())
                .is_some();
        }
        false
    }

    pub fn contains(&self, room: Uuid) -> bool {
        self.rooms.contains_key(&room)
    }

    pub fn members(&self, room: Uuid) -> Vec<Uuid> {
        self.rooms
            .get(&room)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Record the identity a connection announced with its `join` message.
    pub fn set_presence(&self, room: Uuid, connection_id: Uuid, presence: Presence) {
        if let Some(mut members) = self.rooms.get_mut(&room)
            && let Some(member) = members.get_mut(&connection_id)
        {
            member.presence = Some(presence);
        }
    }

    /// Announced identities currently in the room, for roster snapshots.
    pub fn active_users(&self, room: Uuid) -> Vec<Presence> {
        self.rooms
            .get(&room)
            .map(|members| {
                members
                    .values()
                    .filter_map(|m| m.presence.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fan a serialized frame out to every member of a room. Non-blocking:
    /// each member gets at most one copy, and members whose queues are full
    /// or closed are pruned as a side effect. Returns the number of members
    /// the frame was queued for.
    pub fn deliver(&self, room: Uuid, frame: &str) -> usize {
        let delivered;
        let emptied;
        {
            let Some(mut members) = self.rooms.get_mut(&room) else {
                return 0;
            };
            let mut dead = Vec::new();
            let mut sent = 0;
            for (id, member) in members.iter() {
                match member.handle.tx.try_send(frame.to_owned()) {
                    Ok(()) => sent += 1,
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
            for id in &dead {
                members.remove(id);
                debug!(%room, connection = %id, "pruned dead connection during fan-out");
            }
            delivered = sent;
            emptied = members.is_empty();
        }
        if emptied {
            self.rooms.remove_if(&room, |_, members| members.is_empty());
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> (ConnectionHandle, mpsc::Receiver<String>) {
        ConnectionHandle::channel(Uuid::new_v4())
    }

    #[test]
    fn test_join_then_leave_membership() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (a, _rx_a) = conn();
        let a_id = a.id;

        assert!(registry.join(room, a));
        assert_eq!(registry.members(room), vec![a_id]);

        assert!(registry.leave(room, a_id));
        assert!(registry.members(room).is_empty());
        assert!(!registry.contains(room));
    }

    #[test]
    fn test_leave_is_idempotent() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (a, _rx) = conn();
        let a_id = a.id;
        registry.join(room, a);

        assert!(registry.leave(room, a_id));
        assert!(!registry.leave(room, a_id));
        assert!(!registry.leave(Uuid::new_v4(), a_id));
    }

    #[test]
    fn test_second_join_does_not_recreate_room() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (a, _rx_a) = conn();
        let (b, _rx_b) = conn();
        assert!(registry.join(room, a));
        assert!(!registry.join(room, b));
        assert_eq!(registry.members(room).len(), 2);
    }

    #[test]
    fn test_deliver_reaches_each_member_once() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (a, mut rx_a) = conn();
        let (b, mut rx_b) = conn();
        registry.join(room, a);
        registry.join(room, b);

        assert_eq!(registry.deliver(room, "one"), 2);
        assert_eq!(registry.deliver(room, "two"), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(rx.try_recv().unwrap(), "one");
            assert_eq!(rx.try_recv().unwrap(), "two");
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_deliver_to_unknown_room_is_noop() {
        let registry = RoomRegistry::new();
        assert_eq!(registry.deliver(Uuid::new_v4(), "x"), 0);
    }

    #[test]
    fn test_closed_connection_pruned_during_fanout() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (a, rx_a) = conn();
        let (b, mut rx_b) = conn();
        let a_id = a.id;
        registry.join(room, a);
        registry.join(room, b);

        drop(rx_a);
        assert_eq!(registry.deliver(room, "x"), 1);
        assert!(!registry.members(room).contains(&a_id));
        assert_eq!(rx_b.try_recv().unwrap(), "x");
    }

    #[test]
    fn test_full_queue_treated_as_dead() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        // A queue of one: the second frame overflows it.
        let (tx, mut rx) = mpsc::channel(1);
        let id = Uuid::new_v4();
        registry.join(room, ConnectionHandle::new(id, tx));

        assert_eq!(registry.deliver(room, "one"), 1);
        assert_eq!(registry.deliver(room, "two"), 0);
        assert!(registry.members(room).is_empty());
        // The frame that fit is still readable; the overflow was dropped.
        assert_eq!(rx.try_recv().unwrap(), "one");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_room_gc_after_all_members_pruned() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (a, rx_a) = conn();
        registry.join(room, a);
        drop(rx_a);
        registry.deliver(room, "x");
        assert!(!registry.contains(room));
    }

    #[test]
    fn test_presence_roster() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (a, _rx_a) = conn();
        let (b, _rx_b) = conn();
        let a_id = a.id;
        registry.join(room, a);
        registry.join(room, b);

        assert!(registry.active_users(room).is_empty());
        registry.set_presence(
            room,
            a_id,
            Presence {
                user_id: Some("u1".to_string()),
                username: Some("ada".to_string()),
            },
        );
        let roster = registry.active_users(room);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].username.as_deref(), Some("ada"));
    }

    #[test]
    fn test_rooms_are_isolated() {
        let registry = RoomRegistry::new();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        let (a, mut rx_a) = conn();
        let (b, mut rx_b) = conn();
        registry.join(room_a, a);
        registry.join(room_b, b);

        registry.deliver(room_a, "only-a");
        assert_eq!(rx_a.try_recv().unwrap(), "only-a");
        assert!(rx_b.try_recv().is_err());
    }
}
