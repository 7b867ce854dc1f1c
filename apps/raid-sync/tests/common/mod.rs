#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use raid_common::SnowflakeGenerator;
use raid_sync::config::Config;
use raid_sync::db::{MemoryStore, UserProfile};
use raid_sync::error::SyncError;
use raid_sync::models::room::{Channel, RaidRoom};
use raid_sync::sync::{
    BroadcastMessage, Broadcaster, RoomSnapshotProvider, SessionRegistry, StampedView,
    SyncCoordinator, SyncParts, Topic, ViewCache,
};
use raid_sync::AppState;

/// Build a test AppState over an empty in-memory store.
pub fn test_state() -> AppState {
    AppState::new(Config::default(), Arc::new(MemoryStore::new()))
}

/// Build the full application router wired to the test state.
pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    let app = raid_sync::routes::router().with_state(state.clone());
    (app, state)
}

/// A room dated today with `channels` numbered channels.
pub fn room(id: &str, boss: &str, channels: i32) -> RaidRoom {
    let mut room = RaidRoom::new(id, boss, Utc::now().date_naive());
    for number in 1..=channels {
        room.channels
            .push(Channel::new(format!("{id}-ch{number}"), number));
    }
    room
}

/// Commit `room` to the store without notifying anyone.
pub async fn seed_room(store: &MemoryStore, room: RaidRoom) {
    let mut tx = store.begin();
    tx.put_room(room);
    tx.commit().await.expect("seed room");
}

pub fn seed_user(store: &MemoryStore, id: &str, display_name: &str) {
    store.put_user(UserProfile {
        id: id.to_string(),
        display_name: display_name.to_string(),
        avatar_url: None,
    });
}

/// Captures every published message instead of delivering it.
#[derive(Default)]
pub struct RecordingBroadcaster {
    messages: Mutex<Vec<BroadcastMessage>>,
}

impl RecordingBroadcaster {
    pub fn messages(&self) -> Vec<BroadcastMessage> {
        self.messages.lock().clone()
    }

    pub fn on_topic(&self, topic: &Topic) -> Vec<BroadcastMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| &m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn publish(&self, message: BroadcastMessage) -> Result<usize, SyncError> {
        self.messages.lock().push(message);
        Ok(1)
    }
}

/// Counts provider reads and holds each one open for `delay`.
pub struct CountingProvider {
    pub inner: Arc<MemoryStore>,
    pub delay: Duration,
    pub room_reads: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl RoomSnapshotProvider for CountingProvider {
    async fn get_room(&self, room_id: &str) -> Result<Option<Value>, SyncError> {
        self.room_reads
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.get_room(room_id).await
    }

    async fn get_listing(&self) -> Result<Value, SyncError> {
        self.inner.get_listing().await
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub sync: SyncCoordinator,
    pub recorder: Arc<RecordingBroadcaster>,
}

/// A coordinator over `store` that records broadcasts.
pub fn harness_with(store: Arc<MemoryStore>, rooms: Arc<dyn RoomSnapshotProvider>) -> Harness {
    let recorder = Arc::new(RecordingBroadcaster::default());
    let sync = SyncCoordinator::new(SyncParts {
        sessions: Arc::new(SessionRegistry::new()),
        cache: Arc::new(ViewCache::<StampedView>::new(
            Duration::from_secs(10),
            Duration::from_secs(300),
        )),
        rooms,
        users: store.clone(),
        broadcaster: recorder.clone(),
        sequencer: Arc::new(SnowflakeGenerator::new(1)),
    });
    Harness {
        store,
        sync,
        recorder,
    }
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    harness_with(store.clone(), store)
}
