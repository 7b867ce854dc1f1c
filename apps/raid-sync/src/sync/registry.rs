//! Live session bookkeeping: which session watches which room as which user.
//!
//! Presence is per-**user**, not per-session. A user stays present in a room
//! until ALL of their sessions in that room have disconnected.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

/// Identity a session is registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionEntry {
    user_id: String,
    room_id: String,
    last_seen: Instant,
}

/// A membership that was removed from a room, by disconnect, reconnect to
/// another room, or idle eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub session_id: String,
    pub user_id: String,
    pub room_id: String,
    /// True if this was the user's last session in `room_id`.
    pub last_session: bool,
}

/// Sessions of one room. Guarded by its own lock so rooms never contend.
#[derive(Default)]
struct RoomSessions {
    /// session_id → user_id
    sessions: HashMap<String, String>,
    /// user_id → number of live sessions in this room
    users: HashMap<String, usize>,
    /// Set once the room has been unlinked from the registry; writers must
    /// fetch a fresh handle.
    retired: bool,
}

impl RoomSessions {
    fn insert(&mut self, session_id: &str, user_id: &str) {
        if let Some(prev_user) = self
            .sessions
            .insert(session_id.to_string(), user_id.to_string())
        {
            self.release_user(&prev_user);
        }
        *self.users.entry(user_id.to_string()).or_insert(0) += 1;
    }

    /// Returns `Some(last_session)` if the session was in this room.
    fn remove(&mut self, session_id: &str) -> Option<bool> {
        let user_id = self.sessions.remove(session_id)?;
        Some(self.release_user(&user_id))
    }

    fn release_user(&mut self, user_id: &str) -> bool {
        match self.users.get_mut(user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.users.remove(user_id);
                true
            }
            None => true,
        }
    }

    fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

type RoomHandle = Arc<Mutex<RoomSessions>>;

/// Shared registry of all live sessions.
///
/// Sessions live in a `DashMap` keyed by session id; each room has its own
/// `parking_lot::Mutex`. Lock order is session shard → room lock, and no room
/// lock is ever held while touching either map.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    rooms: DashMap<String, RoomHandle>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Register `session_id` as `user_id` watching `room_id`.
    ///
    /// A session that is already registered elsewhere is moved: it leaves its
    /// previous room and joins the new one while both room locks are held, so
    /// no reader sees it in both rooms or in neither. Returns the membership
    /// it left, if any. Reconnecting to the same room with the same user only
    /// refreshes the heartbeat.
    pub fn connect(&self, session_id: &str, user_id: &str, room_id: &str) -> Option<Departure> {
        let now = Instant::now();
        let next = SessionEntry {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            last_seen: now,
        };

        match self.sessions.entry(session_id.to_string()) {
            Entry::Vacant(vacant) => {
                self.with_room(room_id, |room| room.insert(session_id, user_id));
                vacant.insert(next);
                None
            }
            Entry::Occupied(mut occupied) => {
                let prev = occupied.get().clone();
                if prev.room_id == room_id && prev.user_id == user_id {
                    occupied.get_mut().last_seen = now;
                    return None;
                }

                let (last_session, emptied) = if prev.room_id == room_id {
                    // Same room, different user on the same session.
                    self.with_room(room_id, |room| {
                        let last = room.remove(session_id).unwrap_or(true);
                        room.insert(session_id, user_id);
                        (last, false)
                    })
                } else {
                    self.with_two_rooms(&prev.room_id, room_id, |from, to| {
                        let last = from.remove(session_id).unwrap_or(true);
                        to.insert(session_id, user_id);
                        (last, from.is_empty())
                    })
                };
                occupied.insert(next);
                drop(occupied);

                if emptied {
                    self.retire_if_empty(&prev.room_id);
                }

                Some(Departure {
                    session_id: session_id.to_string(),
                    user_id: prev.user_id,
                    room_id: prev.room_id,
                    last_session,
                })
            }
        }
    }

    /// Remove a session. Unknown sessions return `None`; calling this twice,
    /// or racing it with idle eviction, is harmless.
    pub fn disconnect(&self, session_id: &str) -> Option<Departure> {
        let Entry::Occupied(occupied) = self.sessions.entry(session_id.to_string()) else {
            return None;
        };
        let entry = occupied.get().clone();
        // The room still holds this session, so it cannot have been retired.
        let (last_session, emptied) = self.with_room(&entry.room_id, |room| {
            let last = room.remove(session_id).unwrap_or(true);
            (last, room.is_empty())
        });
        occupied.remove();

        if emptied {
            self.retire_if_empty(&entry.room_id);
        }

        Some(Departure {
            session_id: session_id.to_string(),
            user_id: entry.user_id,
            room_id: entry.room_id,
            last_session,
        })
    }

    /// Distinct users with at least one live session in `room_id`.
    pub fn presence_list(&self, room_id: &str) -> BTreeSet<String> {
        match self.room_handle(room_id) {
            Some(room) => room.lock().users.keys().cloned().collect(),
            None => BTreeSet::new(),
        }
    }

    /// Number of live sessions in `room_id`. Diagnostic only.
    pub fn session_count(&self, room_id: &str) -> usize {
        self.room_handle(room_id)
            .map(|room| room.lock().sessions.len())
            .unwrap_or(0)
    }

    /// Total number of registered sessions across all rooms.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Room the session currently watches.
    pub fn room_of(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|e| e.room_id.clone())
    }

    /// Refresh the session's heartbeat. Returns false for unknown sessions.
    pub fn heartbeat(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Evict every session whose last heartbeat is older than `timeout`.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<Departure> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| now.duration_since(e.last_seen) >= timeout)
            .map(|e| e.key().clone())
            .collect();

        // An explicit disconnect may win the race; disconnect() returns None then.
        stale
            .into_iter()
            .filter_map(|session_id| self.disconnect(&session_id))
            .collect()
    }

    fn room_handle(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.get(room_id).map(|r| r.value().clone())
    }

    fn live_room_handle(&self, room_id: &str) -> RoomHandle {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RoomSessions::default())))
            .clone()
    }

    /// Run `f` on the room's sessions, retrying if the handle was retired
    /// between lookup and lock.
    fn with_room<R>(&self, room_id: &str, f: impl FnOnce(&mut RoomSessions) -> R) -> R {
        loop {
            let handle = self.live_room_handle(room_id);
            let mut room = handle.lock();
            if room.retired {
                continue;
            }
            return f(&mut room);
        }
    }

    /// Run `f` with both rooms locked, in room-id order to avoid deadlock.
    fn with_two_rooms<R>(
        &self,
        from_id: &str,
        to_id: &str,
        f: impl FnOnce(&mut RoomSessions, &mut RoomSessions) -> R,
    ) -> R {
        debug_assert_ne!(from_id, to_id);
        loop {
            let from = self.live_room_handle(from_id);
            let to = self.live_room_handle(to_id);
            let (mut from_guard, mut to_guard) = if from_id < to_id {
                let a = from.lock();
                let b = to.lock();
                (a, b)
            } else {
                let b = to.lock();
                let a = from.lock();
                (a, b)
            };
            if from_guard.retired || to_guard.retired {
                continue;
            }
            return f(&mut from_guard, &mut to_guard);
        }
    }

    fn retire_if_empty(&self, room_id: &str) {
        self.rooms.remove_if(room_id, |_, handle| {
            let mut room = handle.lock();
            if room.is_empty() {
                room.retired = true;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn connect_adds_user_to_presence() {
        let registry = SessionRegistry::new();
        assert!(registry.connect("s1", "u1", "r1").is_none());
        assert_eq!(registry.presence_list("r1"), users(&["u1"]));
        assert_eq!(registry.session_count("r1"), 1);
        assert_eq!(registry.room_of("s1").as_deref(), Some("r1"));
    }

    #[test]
    fn multi_session_user_is_listed_once_until_all_disconnect() {
        let registry = SessionRegistry::new();

        registry.connect("s1", "u1", "r1");
        assert_eq!(registry.presence_list("r1"), users(&["u1"]));

        registry.connect("s2", "u1", "r1");
        assert_eq!(registry.presence_list("r1"), users(&["u1"]));
        assert_eq!(registry.session_count("r1"), 2);

        let first = registry.disconnect("s1").unwrap();
        assert!(!first.last_session);
        assert_eq!(registry.presence_list("r1"), users(&["u1"]));

        let second = registry.disconnect("s2").unwrap();
        assert!(second.last_session);
        assert!(registry.presence_list("r1").is_empty());
        assert_eq!(registry.session_count("r1"), 0);
    }

    #[test]
    fn disconnect_unknown_session_is_noop() {
        let registry = SessionRegistry::new();
        assert!(registry.disconnect("bogus").is_none());

        registry.connect("s1", "u1", "r1");
        assert!(registry.disconnect("s1").is_some());
        assert!(registry.disconnect("s1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn reconnect_to_other_room_moves_membership() {
        let registry = SessionRegistry::new();
        registry.connect("s1", "u1", "room-a");

        let departure = registry.connect("s1", "u1", "room-b").unwrap();
        assert_eq!(departure.room_id, "room-a");
        assert_eq!(departure.user_id, "u1");
        assert!(departure.last_session);

        assert!(registry.presence_list("room-a").is_empty());
        assert_eq!(registry.presence_list("room-b"), users(&["u1"]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reconnect_to_same_room_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.connect("s1", "u1", "r1");
        assert!(registry.connect("s1", "u1", "r1").is_none());
        assert_eq!(registry.session_count("r1"), 1);
    }

    #[test]
    fn reconnect_as_other_user_in_same_room_swaps_identity() {
        let registry = SessionRegistry::new();
        registry.connect("s1", "u1", "r1");

        let departure = registry.connect("s1", "u2", "r1").unwrap();
        assert_eq!(departure.user_id, "u1");
        assert!(departure.last_session);
        assert_eq!(registry.presence_list("r1"), users(&["u2"]));
        assert_eq!(registry.session_count("r1"), 1);
    }

    #[test]
    fn moving_keeps_other_sessions_in_previous_room() {
        let registry = SessionRegistry::new();
        registry.connect("s1", "u1", "room-a");
        registry.connect("s2", "u1", "room-a");

        let departure = registry.connect("s1", "u1", "room-b").unwrap();
        assert!(!departure.last_session);
        assert_eq!(registry.presence_list("room-a"), users(&["u1"]));
        assert_eq!(registry.presence_list("room-b"), users(&["u1"]));
    }

    #[test]
    fn empty_rooms_are_unlinked_and_reusable() {
        let registry = SessionRegistry::new();
        registry.connect("s1", "u1", "r1");
        registry.disconnect("s1");
        assert!(registry.rooms.get("r1").is_none());

        registry.connect("s2", "u2", "r1");
        assert_eq!(registry.presence_list("r1"), users(&["u2"]));
    }

    #[test]
    fn heartbeat_unknown_session_returns_false() {
        let registry = SessionRegistry::new();
        assert!(!registry.heartbeat("nope"));
        registry.connect("s1", "u1", "r1");
        assert!(registry.heartbeat("s1"));
    }

    #[test]
    fn sweep_idle_evicts_only_stale_sessions() {
        let registry = SessionRegistry::new();
        registry.connect("s1", "u1", "r1");
        registry.connect("s2", "u2", "r1");

        registry.sessions.get_mut("s1").unwrap().last_seen =
            Instant::now() - Duration::from_secs(600);

        let evicted = registry.sweep_idle(Duration::from_secs(60));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].session_id, "s1");
        assert_eq!(registry.presence_list("r1"), users(&["u2"]));

        // A later explicit disconnect of the evicted session is a no-op.
        assert!(registry.disconnect("s1").is_none());
    }

    #[test]
    fn concurrent_connects_and_disconnects_leave_no_stale_membership() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let session = format!("s{t}-{i}");
                        let room = format!("r{}", i % 3);
                        registry.connect(&session, &format!("u{t}"), &room);
                        registry.connect(&session, &format!("u{t}"), &format!("r{}", (i + 1) % 3));
                        registry.disconnect(&session);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.is_empty());
        for room in ["r0", "r1", "r2"] {
            assert!(registry.presence_list(room).is_empty());
            assert_eq!(registry.session_count(room), 0);
        }
    }

    #[test]
    fn move_is_never_observed_in_both_or_neither_room() {
        let registry = Arc::new(SessionRegistry::new());
        registry.connect("mover", "u1", "room-a");

        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    let room = if i % 2 == 0 { "room-b" } else { "room-a" };
                    registry.connect("mover", "u1", room);
                }
            })
        };

        // Lock both rooms in the registry's order to take a joint snapshot.
        for _ in 0..2_000 {
            let a = registry.live_room_handle("room-a");
            let b = registry.live_room_handle("room-b");
            let ga = a.lock();
            let gb = b.lock();
            if ga.retired || gb.retired {
                continue;
            }
            let in_a = ga.users.contains_key("u1");
            let in_b = gb.users.contains_key("u1");
            assert!(in_a ^ in_b, "in_a={in_a} in_b={in_b}");
        }

        writer.join().unwrap();
    }
}
