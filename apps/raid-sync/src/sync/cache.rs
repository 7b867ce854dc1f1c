//! Read-through cache of computed room and listing views.
//!
//! Entries are normally evicted by commit-driven invalidation; the TTLs are a
//! safety net against a missed invalidation. Each key holds a claim slot: the
//! first caller to miss computes, concurrent callers await the same slot.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::OnceCell;

/// What a cached view describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ViewKey {
    /// Detail view of one room.
    Room(String),
    /// The shared summary listing.
    Listing,
}

impl ViewKey {
    pub fn room(room_id: impl Into<String>) -> Self {
        Self::Room(room_id.into())
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room(id) => write!(f, "room:{id}"),
            Self::Listing => f.write_str("listing"),
        }
    }
}

struct CachedView<V> {
    payload: V,
    generated_at: Instant,
}

struct Slot<V> {
    cell: OnceCell<CachedView<V>>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.cell
            .get()
            .is_some_and(|view| view.generated_at.elapsed() >= ttl)
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// TTL-bounded, invalidation-driven view cache.
pub struct ViewCache<V> {
    entries: DashMap<ViewKey, Arc<Slot<V>>>,
    room_ttl: Duration,
    listing_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> ViewCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(room_ttl: Duration, listing_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            room_ttl,
            listing_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached payload for `key`, computing it on a miss.
    ///
    /// Concurrent misses on the same key run `compute` once; the others wait
    /// for that result. A failed computation is not stored, and the next
    /// caller computes again.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &ViewKey, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let ttl = self.ttl_for(key);
        let slot = {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new()));
            if entry.is_expired(ttl) {
                tracing::trace!(%key, "cached view expired");
                *entry = Arc::new(Slot::new());
            }
            entry.clone()
        };

        if let Some(view) = slot.cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(view.payload.clone());
        }

        let result = slot
            .cell
            .get_or_try_init(|| async {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%key, "computing view");
                let payload = compute().await?;
                Ok::<_, E>(CachedView {
                    payload,
                    generated_at: Instant::now(),
                })
            })
            .await;

        match result {
            Ok(view) => Ok(view.payload.clone()),
            Err(err) => {
                // Unlink the empty slot unless it was replaced or filled meanwhile.
                self.entries.remove_if(key, |_, current| {
                    Arc::ptr_eq(current, &slot) && !current.cell.initialized()
                });
                Err(err)
            }
        }
    }

    /// Evict `key`. The next read recomputes; a computation already in flight
    /// finishes into a detached slot and is never served again.
    pub fn invalidate(&self, key: &ViewKey) {
        if self.entries.remove(key).is_some() {
            tracing::trace!(%key, "view invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
        tracing::trace!("all views invalidated");
    }

    /// Drop expired entries and empty slots nobody is computing. Returns how
    /// many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, slot| {
            let abandoned = !slot.cell.initialized() && Arc::strong_count(slot) == 1;
            !abandoned && !slot.is_expired(self.ttl_for(key))
        });
        before.saturating_sub(self.entries.len())
    }

    /// Whether `key` currently holds a computed, unexpired payload.
    pub fn contains(&self, key: &ViewKey) -> bool {
        let ttl = self.ttl_for(key);
        self.entries
            .get(key)
            .is_some_and(|slot| slot.cell.initialized() && !slot.is_expired(ttl))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn ttl_for(&self, key: &ViewKey) -> Duration {
        match key {
            ViewKey::Room(_) => self.room_ttl,
            ViewKey::Listing => self.listing_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> ViewCache<u32> {
        ViewCache::new(Duration::from_secs(10), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn hit_does_not_recompute() {
        let cache = cache();
        let key = ViewKey::room("r1");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_compute(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn invalidate_forces_recompute() {
        let cache = cache();
        let key = ViewKey::room("r1");

        let v0 = cache
            .get_or_compute(&key, || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        assert_eq!(v0, 1);

        cache.invalidate(&key);
        assert!(!cache.contains(&key));

        let v1 = cache
            .get_or_compute(&key, || async { Ok::<_, ()>(2) })
            .await
            .unwrap();
        assert_eq!(v1, 2);
    }

    #[tokio::test]
    async fn invalidate_absent_key_is_noop() {
        let cache = cache();
        cache.invalidate(&ViewKey::Listing);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn invalidate_all_clears_every_key() {
        let cache = cache();
        for key in [ViewKey::room("a"), ViewKey::room("b"), ViewKey::Listing] {
            cache
                .get_or_compute(&key, || async { Ok::<_, ()>(1) })
                .await
                .unwrap();
        }
        cache.invalidate_all();
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn failed_compute_is_not_cached() {
        let cache = cache();
        let key = ViewKey::room("r1");

        let err = cache
            .get_or_compute(&key, || async { Err::<u32, _>("store down") })
            .await;
        assert_eq!(err, Err("store down"));
        assert!(!cache.contains(&key));

        let ok = cache
            .get_or_compute(&key, || async { Ok::<_, &str>(5) })
            .await;
        assert_eq!(ok, Ok(5));
    }

    #[tokio::test]
    async fn failed_computes_leave_no_entries_behind() {
        let cache = cache();

        for i in 0..1000 {
            let key = ViewKey::room(format!("missing-{i}"));
            let result = cache
                .get_or_compute(&key, || async { Err::<u32, _>("not found") })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().misses, 1000);
    }

    #[tokio::test]
    async fn purge_drops_idle_empty_slots() {
        let cache = cache();
        cache
            .entries
            .insert(ViewKey::room("orphan"), Arc::new(Slot::new()));
        cache
            .get_or_compute(&ViewKey::room("live"), || async { Ok::<_, ()>(1) })
            .await
            .unwrap();

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.contains(&ViewKey::room("live")));
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn expired_entry_is_recomputed() {
        let cache: ViewCache<u32> = ViewCache::new(Duration::ZERO, Duration::from_secs(300));
        let key = ViewKey::room("r1");

        cache
            .get_or_compute(&key, || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        let second = cache
            .get_or_compute(&key, || async { Ok::<_, ()>(2) })
            .await
            .unwrap();
        assert_eq!(second, 2);
        assert_eq!(cache.purge_expired(), 1);
    }

    #[tokio::test]
    async fn listing_uses_its_own_ttl() {
        let cache: ViewCache<u32> = ViewCache::new(Duration::ZERO, Duration::from_secs(300));
        cache
            .get_or_compute(&ViewKey::Listing, || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        assert!(cache.contains(&ViewKey::Listing));
        assert_eq!(cache.purge_expired(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_compute_once() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ViewKey::room("hot");

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute(&key, || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, ()>(42)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidation_during_compute_is_not_overwritten() {
        let cache = Arc::new(cache());
        let key = ViewKey::room("r1");
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(&key, || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, ()>(0)
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        cache.invalidate(&key);
        release_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap(), Ok(0));

        // The pre-invalidation result must not be served.
        let fresh = cache
            .get_or_compute(&key, || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        assert_eq!(fresh, 1);
    }
}
