//! Outbound topics and broadcast messages.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Logical push topic. Transport-agnostic; [`Topic::path`] gives the
/// destination string subscribers see.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Full detail view of one room.
    Room(String),
    /// Who is watching one room.
    Presence(String),
    /// Small deltas for one room that skip the full view.
    Updates(String),
    /// The shared summary listing.
    Listing,
}

impl Topic {
    pub fn path(&self) -> String {
        match self {
            Self::Room(id) => format!("/topic/raid-room/{id}"),
            Self::Presence(id) => format!("/topic/raid-room/{id}/users"),
            Self::Updates(id) => format!("/topic/raid-room/{id}/updates"),
            Self::Listing => "/topic/bosses/today".to_string(),
        }
    }

    /// The room this topic belongs to, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Room(id) | Self::Presence(id) | Self::Updates(id) => Some(id),
            Self::Listing => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path())
    }
}

/// Event names carried on broadcast messages.
pub struct EventName;

impl EventName {
    pub const ROOM_UPDATE: &'static str = "ROOM_UPDATE";
    pub const ROOM_REMOVED: &'static str = "ROOM_REMOVED";
    pub const LISTING_UPDATE: &'static str = "LISTING_UPDATE";
    pub const PRESENCE_UPDATE: &'static str = "PRESENCE_UPDATE";
    pub const CHANNEL_SELECTION: &'static str = "CHANNEL_SELECTION";
}

/// One message fanned out to every subscriber of `topic`.
///
/// `sequence` only grows. Snapshot messages (no `subject`) supersede each
/// other per topic; deltas only supersede earlier deltas with the same
/// `subject`.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastMessage {
    pub topic: Topic,
    pub event: &'static str,
    pub sequence: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub payload: Value,
}

/// High-frequency change broadcast without recomputing the room view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncrementalDelta {
    /// A user started or stopped moving to a channel.
    ChannelSelection {
        user_id: String,
        channel_id: String,
        selecting: bool,
    },
}

impl IncrementalDelta {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ChannelSelection { .. } => EventName::CHANNEL_SELECTION,
        }
    }

    /// Whose state the delta changes. Deltas with different subjects are
    /// independent of each other.
    pub fn subject(&self) -> &str {
        match self {
            Self::ChannelSelection { user_id, .. } => user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_paths() {
        assert_eq!(Topic::Room("7".into()).path(), "/topic/raid-room/7");
        assert_eq!(Topic::Presence("7".into()).path(), "/topic/raid-room/7/users");
        assert_eq!(Topic::Updates("7".into()).path(), "/topic/raid-room/7/updates");
        assert_eq!(Topic::Listing.path(), "/topic/bosses/today");
        assert_eq!(Topic::Listing.room_id(), None);
        assert_eq!(Topic::Updates("7".into()).room_id(), Some("7"));
    }

    #[test]
    fn delta_serializes_with_type_tag() {
        let delta = IncrementalDelta::ChannelSelection {
            user_id: "u1".into(),
            channel_id: "ch1".into(),
            selecting: true,
        };
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["type"], "channel_selection");
        assert_eq!(json["channel_id"], "ch1");
        assert_eq!(json["selecting"], true);
    }
}
