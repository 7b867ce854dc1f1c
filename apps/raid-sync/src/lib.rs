pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;
pub mod sync;

use std::sync::Arc;

use config::Config;
use db::MemoryStore;
use raid_common::SnowflakeGenerator;
use sync::{SessionRegistry, StampedView, SyncCoordinator, SyncParts, TopicBroadcast, ViewCache};

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<MemoryStore>,
    pub broadcast: TopicBroadcast,
    pub sync: SyncCoordinator,
}

impl AppState {
    /// Wire the sync core around `store` using `config`'s cache and fanout
    /// settings.
    pub fn new(config: Config, store: Arc<MemoryStore>) -> Self {
        let broadcast = TopicBroadcast::new(config.broadcast_capacity);
        let sync = SyncCoordinator::new(SyncParts {
            sessions: Arc::new(SessionRegistry::new()),
            cache: Arc::new(ViewCache::<StampedView>::new(
                config.room_view_ttl,
                config.listing_view_ttl,
            )),
            rooms: store.clone(),
            users: store.clone(),
            broadcaster: Arc::new(broadcast.clone()),
            sequencer: Arc::new(SnowflakeGenerator::new(config.worker_id)),
        });

        Self {
            config: Arc::new(config),
            store,
            broadcast,
            sync,
        }
    }
}
