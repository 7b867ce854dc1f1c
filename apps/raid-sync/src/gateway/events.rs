//! Gateway opcodes, event types, and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sync::events::BroadcastMessage;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_SELECT_CHANNEL: u8 = 10;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    /// Broadcast sequence. Only grows per topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<i64>,
    /// Destination topic path for forwarded broadcasts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0) that is not part of any topic.
    pub fn dispatch(event_name: &str, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: None,
            topic: None,
            d: data,
        }
    }

    /// Wrap a fanout message for delivery to one client.
    pub fn forward(message: &BroadcastMessage) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(message.event.to_string()),
            s: Some(message.sequence),
            topic: Some(message.topic.path()),
            d: message.payload.clone(),
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack() -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            topic: None,
            d: Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

// ---------------------------------------------------------------------------
// IDENTIFY payload
// ---------------------------------------------------------------------------

/// Sent first to join a room, and again later to switch rooms.
#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub user_id: String,
    pub room_id: String,
}

// ---------------------------------------------------------------------------
// SELECT_CHANNEL payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SelectChannelPayload {
    pub channel_id: String,
    pub selecting: bool,
}

// ---------------------------------------------------------------------------
// Dispatch event types
// ---------------------------------------------------------------------------

/// Gateway-only event names. Broadcast events reuse the fanout's names.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "READY";
    pub const ROOM_SWITCHED: &'static str = "ROOM_SWITCHED";
}
