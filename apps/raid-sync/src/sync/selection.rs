//! Which channel each user in a room is currently moving to.
//!
//! A user moves to at most one channel per room. The board only lives in
//! memory; it is cleared when the user's last session leaves the room.

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;

#[derive(Default)]
pub struct SelectionBoard {
    /// room_id → (user_id → channel_id)
    rooms: DashMap<String, HashMap<String, String>>,
}

/// What a selection request changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionChange {
    /// Channel the user was moving to before, if it differs from the new one.
    pub replaced: Option<String>,
    /// Whether the user is now moving to the requested channel.
    pub selecting: bool,
}

impl SelectionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (`selecting`) or stop moving `user_id` to `channel_id`.
    /// Stopping a channel the user is not moving to changes nothing.
    pub fn select(
        &self,
        room_id: &str,
        user_id: &str,
        channel_id: &str,
        selecting: bool,
    ) -> SelectionChange {
        let mut room = self.rooms.entry(room_id.to_string()).or_default();
        let change = if selecting {
            let previous = room.insert(user_id.to_string(), channel_id.to_string());
            SelectionChange {
                replaced: previous.filter(|c| c != channel_id),
                selecting: true,
            }
        } else {
            if room.get(user_id).is_some_and(|c| c == channel_id) {
                room.remove(user_id);
            }
            SelectionChange {
                replaced: None,
                selecting: false,
            }
        };
        let empty = room.is_empty();
        drop(room);
        if empty {
            self.rooms.remove_if(room_id, |_, users| users.is_empty());
        }
        change
    }

    /// Forget `user_id` in `room_id`, returning the channel they were moving to.
    pub fn clear_user(&self, room_id: &str, user_id: &str) -> Option<String> {
        let mut room = self.rooms.get_mut(room_id)?;
        let channel = room.remove(user_id);
        let empty = room.is_empty();
        drop(room);
        if empty {
            self.rooms.remove_if(room_id, |_, users| users.is_empty());
        }
        channel
    }

    pub fn clear_room(&self, room_id: &str) {
        self.rooms.remove(room_id);
    }

    /// user_id → channel_id for everyone moving in `room_id`.
    pub fn snapshot(&self, room_id: &str) -> BTreeMap<String, String> {
        self.rooms
            .get(room_id)
            .map(|room| room.iter().map(|(u, c)| (u.clone(), c.clone())).collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
