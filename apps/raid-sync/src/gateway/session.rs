//! Per-connection gateway session state.

use std::collections::HashMap;

use crate::sync::events::{BroadcastMessage, Topic};

/// What one last-applied sequence covers: a whole snapshot topic, or one
/// subject's deltas within a topic.
type GateKey = (Topic, Option<String>);

/// State for a single WebSocket connection. Owned by its event loop.
pub struct GatewaySession {
    /// Unique session identifier (`gw_` prefixed ULID).
    pub session_id: String,
    pub user_id: String,
    room_id: String,
    /// Highest sequence applied per topic (and per subject for deltas).
    applied: HashMap<GateKey, i64>,
}

impl GatewaySession {
    pub fn new(session_id: String, user_id: String, room_id: String) -> Self {
        Self {
            session_id,
            user_id,
            room_id,
            applied: HashMap::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Move to another room, forgetting sequences of the old room's topics.
    pub fn switch_room(&mut self, room_id: String) {
        self.applied.retain(|(topic, _), _| topic.room_id().is_none());
        self.room_id = room_id;
    }

    /// The current room's topics plus the shared listing.
    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        match topic.room_id() {
            Some(room_id) => room_id == self.room_id,
            None => true,
        }
    }

    /// Record that `sequence` was delivered on snapshot topic `topic`
    /// outside the fanout (the READY snapshot).
    pub fn mark_applied(&mut self, topic: Topic, sequence: i64) {
        let last = self.applied.entry((topic, None)).or_insert(sequence);
        *last = (*last).max(sequence);
    }

    /// Whether `message` should be forwarded: subscribed and strictly newer
    /// than anything already applied for its topic and subject.
    pub fn accept(&mut self, message: &BroadcastMessage) -> bool {
        if !self.is_subscribed(&message.topic) {
            return false;
        }
        let key = (message.topic.clone(), message.subject.clone());
        match self.applied.get_mut(&key) {
            Some(last) if *last >= message.sequence => false,
            Some(last) => {
                *last = message.sequence;
                true
            }
            None => {
                self.applied.insert(key, message.sequence);
                true
            }
        }
    }
}
