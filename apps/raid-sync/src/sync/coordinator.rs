//! Mutation → invalidate → recompute → broadcast.
//!
//! Callers report a committed-or-about-to-commit change; the coordinator
//! defers the refresh until the unit-of-work commits, drops the cached view,
//! reads a fresh snapshot through the cache, and publishes it. Presence and
//! incremental deltas skip the deferral and the cache entirely.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use raid_common::SnowflakeGenerator;
use serde::Serialize;
use serde_json::Value;

use crate::error::SyncError;

use super::cache::{CacheStats, ViewCache, ViewKey};
use super::deferred::{Deferral, DeferredCommitQueue, QueueStats, UnitOfWork};
use super::events::{BroadcastMessage, EventName, IncrementalDelta, Topic};
use super::fanout::Broadcaster;
use super::provider::{RoomSnapshotProvider, UserDirectory};
use super::registry::{Departure, SessionRegistry};
use super::selection::SelectionBoard;

/// A view plus the sequence taken just before it was read from the store.
///
/// A view with a higher sequence was read no earlier than one with a lower
/// sequence, so subscribers can keep the highest and drop the rest.
#[derive(Debug, Clone)]
pub struct StampedView {
    pub sequence: i64,
    pub payload: Arc<Value>,
}

/// One user in a room's presence broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceSnapshot {
    pub room_id: String,
    pub sequence: i64,
    pub users: Vec<PresenceEntry>,
}

/// Outcome of one sweeper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_sessions: usize,
    pub purged_views: usize,
}

/// Everything the coordinator depends on, wired once at startup.
pub struct SyncParts {
    pub sessions: Arc<SessionRegistry>,
    pub cache: Arc<ViewCache<StampedView>>,
    pub rooms: Arc<dyn RoomSnapshotProvider>,
    pub users: Arc<dyn UserDirectory>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub sequencer: Arc<SnowflakeGenerator>,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    sessions: Arc<SessionRegistry>,
    cache: Arc<ViewCache<StampedView>>,
    rooms: Arc<dyn RoomSnapshotProvider>,
    users: Arc<dyn UserDirectory>,
    broadcaster: Arc<dyn Broadcaster>,
    sequencer: Arc<SnowflakeGenerator>,
    queue: DeferredCommitQueue,
    selections: Arc<SelectionBoard>,
}

impl SyncCoordinator {
    pub fn new(parts: SyncParts) -> Self {
        Self {
            sessions: parts.sessions,
            cache: parts.cache,
            rooms: parts.rooms,
            users: parts.users,
            broadcaster: parts.broadcaster,
            sequencer: parts.sequencer,
            queue: DeferredCommitQueue::new(),
            selections: Arc::new(SelectionBoard::new()),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    // -----------------------------------------------------------------------
    // Commit-gated notifications
    // -----------------------------------------------------------------------

    /// Refresh and broadcast `room_id`'s detail view once `uow` commits, or
    /// now if there is no active unit-of-work.
    pub async fn notify_room_changed(
        &self,
        uow: Option<&dyn UnitOfWork>,
        room_id: &str,
    ) -> Deferral {
        let this = self.clone();
        let room_id = room_id.to_string();
        let action = async move { this.refresh_room(&room_id).await }.boxed();
        self.queue.run_after_commit(uow, "room_refresh", action).await
    }

    /// Refresh and broadcast the summary listing once `uow` commits.
    pub async fn notify_listing_changed(&self, uow: Option<&dyn UnitOfWork>) -> Deferral {
        let this = self.clone();
        let action = async move { this.refresh_listing().await }.boxed();
        self.queue.run_after_commit(uow, "listing_refresh", action).await
    }

    /// A room was deleted or completed: every cached view may be affected.
    /// Once `uow` commits, clears the cache, tells the room's viewers it is
    /// gone, and broadcasts a fresh listing.
    pub async fn notify_room_removed(
        &self,
        uow: Option<&dyn UnitOfWork>,
        room_id: &str,
    ) -> Deferral {
        let this = self.clone();
        let room_id = room_id.to_string();
        let action = async move {
            this.cache.invalidate_all();
            this.selections.clear_room(&room_id);
            let sequence = this.sequencer.generate();
            this.publish(
                Topic::Room(room_id.clone()),
                EventName::ROOM_REMOVED,
                sequence,
                None,
                serde_json::json!({ "room_id": room_id, "removed": true }),
            );
            this.refresh_listing().await
        }
        .boxed();
        self.queue.run_after_commit(uow, "room_removed", action).await
    }

    // -----------------------------------------------------------------------
    // Immediate notifications
    // -----------------------------------------------------------------------

    /// Broadcast the current presence list of `room_id`. Never deferred.
    pub async fn notify_presence_changed(&self, room_id: &str) {
        let snapshot = self.presence(room_id).await;
        match serde_json::to_value(&snapshot.users) {
            Ok(users) => self.publish(
                Topic::Presence(room_id.to_string()),
                EventName::PRESENCE_UPDATE,
                snapshot.sequence,
                None,
                serde_json::json!({
                    "type": "connected_users",
                    "room_id": room_id,
                    "users": users,
                }),
            ),
            Err(err) => tracing::warn!(%room_id, %err, "failed to encode presence"),
        }
    }

    /// Broadcast a small delta for `room_id` without touching the cache.
    pub fn notify_incremental_change(&self, room_id: &str, delta: &IncrementalDelta) {
        let sequence = self.sequencer.generate();
        match serde_json::to_value(delta) {
            Ok(payload) => self.publish(
                Topic::Updates(room_id.to_string()),
                delta.event_name(),
                sequence,
                Some(delta.subject().to_string()),
                payload,
            ),
            Err(err) => tracing::warn!(%room_id, %err, "failed to encode delta"),
        }
    }

    /// Record that `user_id` started or stopped moving to `channel_id` and
    /// broadcast the delta. Moving to a new channel first releases the old one.
    pub fn select_channel(
        &self,
        room_id: &str,
        user_id: &str,
        channel_id: &str,
        selecting: bool,
    ) {
        let change = self.selections.select(room_id, user_id, channel_id, selecting);
        if let Some(previous) = change.replaced {
            self.notify_incremental_change(
                room_id,
                &IncrementalDelta::ChannelSelection {
                    user_id: user_id.to_string(),
                    channel_id: previous,
                    selecting: false,
                },
            );
        }
        self.notify_incremental_change(
            room_id,
            &IncrementalDelta::ChannelSelection {
                user_id: user_id.to_string(),
                channel_id: channel_id.to_string(),
                selecting: change.selecting,
            },
        );
    }

    /// user_id → channel_id of everyone currently moving in `room_id`.
    pub fn selections(&self, room_id: &str) -> BTreeMap<String, String> {
        self.selections.snapshot(room_id)
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Register a session in `room_id` and broadcast presence for the room it
    /// joined and, on a room switch, the room it left.
    pub async fn join_room(
        &self,
        session_id: &str,
        user_id: &str,
        room_id: &str,
    ) -> Option<Departure> {
        let departure = self.sessions.connect(session_id, user_id, room_id);
        if let Some(left) = &departure {
            if left.room_id != room_id {
                self.release_selection(left);
                self.notify_presence_changed(&left.room_id).await;
            }
        }
        self.notify_presence_changed(room_id).await;
        departure
    }

    /// Remove a session and broadcast the room's new presence. Unknown
    /// sessions are ignored.
    pub async fn leave(&self, session_id: &str) -> Option<Departure> {
        let departure = self.sessions.disconnect(session_id)?;
        self.release_selection(&departure);
        self.notify_presence_changed(&departure.room_id).await;
        Some(departure)
    }

    /// Evict idle sessions (broadcasting presence for their rooms) and drop
    /// expired cached views.
    pub async fn sweep(&self, idle_timeout: Duration) -> SweepReport {
        let departures = self.sessions.sweep_idle(idle_timeout);
        for departure in &departures {
            self.release_selection(departure);
        }
        let rooms: BTreeSet<&str> = departures.iter().map(|d| d.room_id.as_str()).collect();
        for room_id in &rooms {
            self.notify_presence_changed(room_id).await;
        }
        SweepReport {
            evicted_sessions: departures.len(),
            purged_views: self.cache.purge_expired(),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read-through room view. `SyncError::NotFound` for a missing room,
    /// which is never cached.
    pub async fn room_view(&self, room_id: &str) -> Result<StampedView, SyncError> {
        self.cache
            .get_or_compute(&ViewKey::room(room_id), || async {
                let sequence = self.sequencer.generate();
                let payload = self
                    .rooms
                    .get_room(room_id)
                    .await?
                    .ok_or_else(|| SyncError::room_not_found(room_id))?;
                Ok::<_, SyncError>(StampedView {
                    sequence,
                    payload: Arc::new(payload),
                })
            })
            .await
    }

    /// Read-through summary listing.
    pub async fn listing_view(&self) -> Result<StampedView, SyncError> {
        self.cache
            .get_or_compute(&ViewKey::Listing, || async {
                let sequence = self.sequencer.generate();
                let payload = self.rooms.get_listing().await?;
                Ok::<_, SyncError>(StampedView {
                    sequence,
                    payload: Arc::new(payload),
                })
            })
            .await
    }

    /// Current presence of `room_id`, enriched with display details.
    ///
    /// Users the directory does not know are left out; if the directory
    /// itself fails, the user is listed without details.
    pub async fn presence(&self, room_id: &str) -> PresenceSnapshot {
        let sequence = self.sequencer.generate();
        let user_ids = self.sessions.presence_list(room_id);

        let mut users = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            match self.users.display_info(&user_id).await {
                Ok(Some(info)) => users.push(PresenceEntry {
                    user_id,
                    display_name: Some(info.display_name),
                    avatar_url: info.avatar_url,
                }),
                Ok(None) => {
                    tracing::debug!(%room_id, %user_id, "present user not in directory");
                }
                Err(err) => {
                    tracing::warn!(%room_id, %user_id, %err, "user directory lookup failed");
                    users.push(PresenceEntry {
                        user_id,
                        display_name: None,
                        avatar_url: None,
                    });
                }
            }
        }

        PresenceSnapshot {
            room_id: room_id.to_string(),
            sequence,
            users,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn refresh_room(&self, room_id: &str) -> Result<(), SyncError> {
        self.cache.invalidate(&ViewKey::room(room_id));
        match self.room_view(room_id).await {
            Ok(view) => {
                self.publish(
                    Topic::Room(room_id.to_string()),
                    EventName::ROOM_UPDATE,
                    view.sequence,
                    None,
                    Value::clone(&view.payload),
                );
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                tracing::debug!(%room_id, "room gone before refresh, skipping broadcast");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn refresh_listing(&self) -> Result<(), SyncError> {
        self.cache.invalidate(&ViewKey::Listing);
        let view = self.listing_view().await?;
        self.publish(
            Topic::Listing,
            EventName::LISTING_UPDATE,
            view.sequence,
            None,
            Value::clone(&view.payload),
        );
        Ok(())
    }

    /// A user whose last session left a room is no longer moving there.
    fn release_selection(&self, departure: &Departure) {
        if !departure.last_session {
            return;
        }
        let cleared = self
            .selections
            .clear_user(&departure.room_id, &departure.user_id);
        if let Some(channel_id) = cleared {
            tracing::debug!(
                room_id = %departure.room_id,
                user_id = %departure.user_id,
                %channel_id,
                "clearing channel selection of departed user"
            );
            self.notify_incremental_change(
                &departure.room_id,
                &IncrementalDelta::ChannelSelection {
                    user_id: departure.user_id.clone(),
                    channel_id,
                    selecting: false,
                },
            );
        }
    }

    /// Fire-and-forget. Delivery failures are logged, never returned.
    fn publish(
        &self,
        topic: Topic,
        event: &'static str,
        sequence: i64,
        subject: Option<String>,
        payload: Value,
    ) {
        let message = BroadcastMessage {
            topic,
            event,
            sequence,
            subject,
            payload,
        };
        let topic = message.topic.path();
        match self.broadcaster.publish(message) {
            Ok(receivers) => tracing::trace!(%topic, event, sequence, receivers, "broadcast sent"),
            Err(err) => tracing::debug!(%topic, event, %err, "broadcast dropped"),
        }
    }
}
