//! Connection Registry
//!
//! Tracks live transport channels per user and per-room membership, and
//! routes outbound messages to them. Generic over the outbound message type
//! so it has no dependency on the wire protocol; `transport`/`coordinator`
//! instantiate it with the server's message enum.

use crate::error::RegistryError;
use crate::ids::{RoomId, UserId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A single live transport channel for a user.
///
/// Channels are compared by the sender's `same_channel` so a dead one can be
/// pruned without needing an explicit identity type.
struct Channel<M> {
    tx: mpsc::Sender<M>,
}

struct UserEntry<M> {
    channels: Vec<Channel<M>>,
    room: Option<RoomId>,
}

/// Per-user channel sets and per-room membership, with concurrent,
/// failure-isolated fan-out.
pub struct Registry<M> {
    users: RwLock<HashMap<UserId, UserEntry<M>>>,
    rooms: RwLock<HashMap<RoomId, HashSet<UserId>>>,
    send_timeout: Duration,
}

impl<M> Registry<M>
where
    M: Clone + Send + 'static,
{
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Register a channel for `user_id`, joining `room_id`.
    pub fn register(&self, user_id: UserId, room_id: RoomId, channel: mpsc::Sender<M>) {
        {
            let mut users = self.users.write();
            let entry = users.entry(user_id.clone()).or_insert_with(|| UserEntry {
                channels: Vec::new(),
                room: None,
            });
            entry.channels.push(Channel { tx: channel });
            entry.room = Some(room_id.clone());
        }
        {
            let mut rooms = self.rooms.write();
            rooms.entry(room_id.clone()).or_default().insert(user_id.clone());
        }
        debug!(%user_id, %room_id, "registered connection");
    }

    /// Remove `channel` from `user_id`'s channel set. Drops the user (and,
    /// if they were the last member, the room) once no channels remain.
    pub fn unregister(&self, user_id: &UserId, channel: &mpsc::Sender<M>) {
        let room = {
            let mut users = self.users.write();
            let Some(entry) = users.get_mut(user_id) else {
                return;
            };
            entry.channels.retain(|c| !c.tx.same_channel(channel));
            if entry.channels.is_empty() {
                let room = entry.room.take();
                users.remove(user_id);
                room
            } else {
                None
            }
        };

        if let Some(room_id) = room {
            self.drop_from_room(user_id, &room_id);
        }
    }

    fn drop_from_room(&self, user_id: &UserId, room_id: &RoomId) {
        let mut rooms = self.rooms.write();
        if let Some(members) = rooms.get_mut(room_id) {
            members.remove(user_id);
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
        debug!(%user_id, %room_id, "dropped from room");
    }

    /// Send `message` to every live channel for `user_id`. Dead channels are
    /// pruned as they're discovered; if all of them die, the user is
    /// unregistered entirely.
    pub async fn send_to_user(&self, user_id: &UserId, message: M) -> Result<(), RegistryError> {
        let (senders, room) = {
            let users = self.users.read();
            match users.get(user_id) {
                Some(entry) => (
                    entry.channels.iter().map(|c| c.tx.clone()).collect::<Vec<_>>(),
                    entry.room.clone(),
                ),
                None => return Err(RegistryError::UserNotPresent(user_id.to_string())),
            }
        };

        if senders.is_empty() {
            return Err(RegistryError::UserNotPresent(user_id.to_string()));
        }

        let mut any_alive = false;
        for tx in &senders {
            match tokio::time::timeout(self.send_timeout, tx.send(message.clone())).await {
                Ok(Ok(())) => any_alive = true,
                Ok(Err(_)) => warn!(%user_id, "channel closed during send"),
                Err(_) => warn!(%user_id, "send timed out"),
            }
        }

        self.prune_dead(user_id, &senders);

        if !any_alive {
            if let Some(room_id) = room {
                self.drop_from_room(user_id, &room_id);
            }
            self.users.write().remove(user_id);
            return Err(RegistryError::ChannelClosed);
        }
        Ok(())
    }

    fn prune_dead(&self, user_id: &UserId, observed: &[mpsc::Sender<M>]) {
        let mut users = self.users.write();
        if let Some(entry) = users.get_mut(user_id) {
            entry
                .channels
                .retain(|c| observed.iter().any(|tx| tx.same_channel(&c.tx)) && !c.tx.is_closed());
        }
    }

    /// Concurrently send `message` to every member of `room_id` other than
    /// `exclude`. Failures are isolated per recipient; this never returns an
    /// error, since a dead listener in a crowded room shouldn't abort the
    /// broadcast.
    pub async fn send_to_room(&self, room_id: &RoomId, message: M, exclude: Option<&UserId>) {
        let members = self.members(room_id);
        let targets: Vec<UserId> = members
            .into_iter()
            .filter(|u| exclude.map_or(true, |ex| ex != u))
            .collect();

        let sends = targets.into_iter().map(|user_id| {
            let message = message.clone();
            async move {
                if let Err(e) = self.send_to_user(&user_id, message).await {
                    warn!(%user_id, %room_id, error = %e, "room fan-out failed for recipient");
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    /// Snapshot of current user IDs in `room_id`.
    pub fn members(&self, room_id: &RoomId) -> Vec<UserId> {
        self.rooms
            .read()
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `user_id` currently has at least one live channel.
    pub fn is_present(&self, user_id: &UserId) -> bool {
        self.users.read().contains_key(user_id)
    }
}
