//! In-process room store.
//!
//! Mutations are staged on a [`Transaction`] and applied together on
//! commit; readers only ever see committed state. The transaction doubles as
//! the [`UnitOfWork`] that after-commit broadcasts attach to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::SyncError;
use crate::models::room::{Listing, RaidRoom};
use crate::sync::deferred::{CommitHook, CommitScope, UnitOfWork};
use crate::sync::provider::{DisplayInfo, RoomSnapshotProvider, UserDirectory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<String, RaidRoom>>,
    users: RwLock<HashMap<String, UserProfile>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction. Nothing it stages is visible until
    /// [`Transaction::commit`].
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            staged: Vec::new(),
            scope: CommitScope::new(),
        }
    }

    /// Committed copy of a room.
    pub fn room(&self, room_id: &str) -> Option<RaidRoom> {
        self.rooms.read().get(room_id).cloned()
    }

    pub fn put_user(&self, profile: UserProfile) {
        self.users.write().insert(profile.id.clone(), profile);
    }

    /// Make every read fail with `SyncError::Store` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SyncError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::Store("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomSnapshotProvider for MemoryStore {
    async fn get_room(&self, room_id: &str) -> Result<Option<Value>, SyncError> {
        self.check_available()?;
        let room = self.rooms.read().get(room_id).cloned();
        room.map(serde_json::to_value)
            .transpose()
            .map_err(SyncError::from)
    }

    async fn get_listing(&self) -> Result<Value, SyncError> {
        self.check_available()?;
        let today = Utc::now().date_naive();
        let listing = {
            let rooms = self.rooms.read();
            Listing::build(rooms.values(), today)
        };
        Ok(serde_json::to_value(listing)?)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn display_info(&self, user_id: &str) -> Result<Option<DisplayInfo>, SyncError> {
        self.check_available()?;
        Ok(self.users.read().get(user_id).map(|p| DisplayInfo {
            display_name: p.display_name.clone(),
            avatar_url: p.avatar_url.clone(),
        }))
    }
}

enum Mutation {
    Put(RaidRoom),
    Remove(String),
}

/// Staged writes against a [`MemoryStore`].
///
/// Dropping a transaction without committing aborts it.
pub struct Transaction<'a> {
    store: &'a MemoryStore,
    staged: Vec<Mutation>,
    scope: CommitScope,
}

impl Transaction<'_> {
    /// The room as this transaction sees it: staged writes first, then
    /// committed state.
    pub fn room(&self, room_id: &str) -> Option<RaidRoom> {
        for mutation in self.staged.iter().rev() {
            match mutation {
                Mutation::Put(room) if room.id == room_id => return Some(room.clone()),
                Mutation::Remove(id) if id == room_id => return None,
                _ => {}
            }
        }
        self.store.room(room_id)
    }

    pub fn put_room(&mut self, room: RaidRoom) {
        self.staged.push(Mutation::Put(room));
    }

    /// Stage a removal. Returns whether the room existed from this
    /// transaction's point of view.
    pub fn remove_room(&mut self, room_id: &str) -> bool {
        let existed = self.room(room_id).is_some();
        self.staged.push(Mutation::Remove(room_id.to_string()));
        existed
    }

    /// Read-modify-write a room. Returns `false` if it does not exist.
    pub fn update_room<F>(&mut self, room_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut RaidRoom),
    {
        match self.room(room_id) {
            Some(mut room) => {
                apply(&mut room);
                self.put_room(room);
                true
            }
            None => false,
        }
    }

    /// Apply every staged write at once, then run after-commit hooks.
    pub async fn commit(self) -> Result<(), SyncError> {
        self.store.check_available()?;
        {
            let mut rooms = self.store.rooms.write();
            for mutation in &self.staged {
                match mutation {
                    Mutation::Put(room) => {
                        rooms.insert(room.id.clone(), room.clone());
                    }
                    Mutation::Remove(id) => {
                        rooms.remove(id);
                    }
                }
            }
        }
        tracing::debug!(writes = self.staged.len(), "transaction committed");
        self.scope.commit().await;
        Ok(())
    }

    /// Discard staged writes and attached hooks.
    pub fn abort(self) {
        self.scope.abort();
    }
}

impl UnitOfWork for Transaction<'_> {
    fn is_active(&self) -> bool {
        self.scope.is_active()
    }

    fn on_commit(&self, hook: CommitHook) -> Result<(), CommitHook> {
        self.scope.on_commit(hook)
    }
}
