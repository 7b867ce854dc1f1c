//! Broadcast hub for fanning messages out to connected gateway sessions.
//!
//! Uses a single `tokio::sync::broadcast` channel. Each gateway session
//! subscribes and filters by topic locally, which suits a single-process
//! deployment.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::SyncError;

use super::events::BroadcastMessage;

/// Delivers a message to all current subscribers of its topic.
///
/// Must not block. Delivery is best-effort: an error means nobody received it.
pub trait Broadcaster: Send + Sync {
    /// Returns the number of receivers the message was handed to.
    fn publish(&self, message: BroadcastMessage) -> Result<usize, SyncError>;
}

/// In-process fanout. Cloneable; store in `AppState`.
#[derive(Clone)]
pub struct TopicBroadcast {
    sender: broadcast::Sender<Arc<BroadcastMessage>>,
}

impl TopicBroadcast {
    /// Slow receivers that fall more than `capacity` messages behind skip
    /// ahead (`RecvError::Lagged`).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Each gateway session calls this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastMessage>> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Broadcaster for TopicBroadcast {
    fn publish(&self, message: BroadcastMessage) -> Result<usize, SyncError> {
        let topic = message.topic.path();
        self.sender
            .send(Arc::new(message))
            .map_err(|_| SyncError::Delivery {
                topic,
                reason: "no subscribers".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::events::{EventName, Topic};

    fn message(sequence: i64) -> BroadcastMessage {
        BroadcastMessage {
            topic: Topic::Listing,
            event: EventName::LISTING_UPDATE,
            sequence,
            subject: None,
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_delivery_error() {
        let hub = TopicBroadcast::new(8);
        let err = hub.publish(message(1)).unwrap_err();
        assert!(matches!(err, SyncError::Delivery { .. }));
    }

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let hub = TopicBroadcast::new(8);
        let mut rx = hub.subscribe();

        assert_eq!(hub.publish(message(1)).unwrap(), 1);
        hub.publish(message(2)).unwrap();

        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 2);
    }
}
