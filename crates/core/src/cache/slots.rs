use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::cache::ttl::CacheEntry;
use crate::clock::SharedClock;
use crate::domain::slot::Slot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotFreshness {
    /// Served from a cache entry inside its TTL.
    Cached,
    /// This call performed the refresh.
    Refreshed,
    /// Refresh failed or timed out; the last known slots were served.
    Stale,
    /// Refresh failed and nothing was cached yet.
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotLookup {
    pub slots: Vec<Slot>,
    pub freshness: SlotFreshness,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SlotCacheStats {
    pub cached_slots: usize,
    pub age_secs: Option<i64>,
    pub fetches: u64,
    pub last_refresh_failed: bool,
}

/// Slots fetched for one window of time.
struct CachedWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    entry: CacheEntry<Vec<Slot>>,
}

impl CachedWindow {
    fn covers(&self, range_start: DateTime<Utc>, range_end: DateTime<Utc>) -> bool {
        self.start <= range_start && range_end <= self.end
    }
}

/// Cache of the scheduling provider's free slots with single-flight refresh.
///
/// An entry answers only requests that fall inside the window it was fetched
/// for. Refreshes fetch one TTL past the requested end so a rolling
/// `[now, now + horizon]` request stays covered until the entry expires.
///
/// Concurrent callers that find the entry stale queue on one refresh lock.
/// Whoever gets it first fetches; the rest re-check freshness after acquiring
/// the lock and reuse that result. A caller that waits longer than
/// `wait_timeout` is served the stale value instead.
pub struct SlotCache {
    entry: RwLock<Option<CachedWindow>>,
    refresh_lock: Mutex<()>,
    ttl: Duration,
    wait_timeout: std::time::Duration,
    clock: SharedClock,
    fetches: AtomicU64,
    last_refresh_failed: AtomicBool,
}

impl SlotCache {
    pub fn new(ttl: Duration, wait_timeout: std::time::Duration, clock: SharedClock) -> Self {
        Self {
            entry: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            ttl,
            wait_timeout,
            clock,
            fetches: AtomicU64::new(0),
            last_refresh_failed: AtomicBool::new(false),
        }
    }

    pub async fn get_or_refresh<F, Fut, E>(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        fetch: F,
    ) -> SlotLookup
    where
        F: FnOnce(DateTime<Utc>, DateTime<Utc>) -> Fut,
        Fut: Future<Output = Result<Vec<Slot>, E>>,
        E: Display,
    {
        if let Some(slots) = self.fresh_slots(range_start, range_end).await {
            return lookup(filter_by_range(&slots, range_start, range_end), SlotFreshness::Cached);
        }

        let guard = match tokio::time::timeout(self.wait_timeout, self.refresh_lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    event_name = "core.slot_cache.refresh_wait_timeout",
                    correlation_id = "slot_cache",
                    wait_ms = self.wait_timeout.as_millis() as u64,
                    "gave up waiting for in-flight slot refresh"
                );
                return self.stale_lookup(range_start, range_end).await;
            }
        };

        if let Some(slots) = self.fresh_slots(range_start, range_end).await {
            drop(guard);
            return lookup(filter_by_range(&slots, range_start, range_end), SlotFreshness::Cached);
        }

        let window_end = range_end + self.ttl;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let result = fetch(range_start, window_end).await;
        let outcome = match result {
            Ok(slots) => {
                debug!(
                    event_name = "core.slot_cache.refreshed",
                    correlation_id = "slot_cache",
                    slot_count = slots.len(),
                    "slot cache refreshed"
                );
                let filtered = filter_by_range(&slots, range_start, range_end);
                *self.entry.write().await = Some(CachedWindow {
                    start: range_start,
                    end: window_end,
                    entry: CacheEntry::new(slots, self.clock.now()),
                });
                self.last_refresh_failed.store(false, Ordering::Relaxed);
                lookup(filtered, SlotFreshness::Refreshed)
            }
            Err(error) => {
                warn!(
                    event_name = "core.slot_cache.refresh_failed",
                    correlation_id = "slot_cache",
                    error = %error,
                    "slot refresh failed; keeping previous slots"
                );
                self.last_refresh_failed.store(true, Ordering::Relaxed);
                self.stale_lookup(range_start, range_end).await
            }
        };
        drop(guard);
        outcome
    }

    async fn fresh_slots(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Option<Vec<Slot>> {
        let now = self.clock.now();
        let cached = self.entry.read().await;
        cached
            .as_ref()
            .filter(|window| window.entry.is_fresh(now, self.ttl))
            .filter(|window| window.covers(range_start, range_end))
            .map(|window| window.entry.value.clone())
    }

    async fn stale_lookup(&self, range_start: DateTime<Utc>, range_end: DateTime<Utc>) -> SlotLookup {
        match self.entry.read().await.as_ref() {
            Some(window) => lookup(
                filter_by_range(&window.entry.value, range_start, range_end),
                SlotFreshness::Stale,
            ),
            None => lookup(Vec::new(), SlotFreshness::Unavailable),
        }
    }

    pub async fn stats(&self) -> SlotCacheStats {
        let now = self.clock.now();
        let cached = self.entry.read().await;
        SlotCacheStats {
            cached_slots: cached.as_ref().map_or(0, |window| window.entry.value.len()),
            age_secs: cached.as_ref().map(|window| window.entry.age(now).num_seconds()),
            fetches: self.fetches.load(Ordering::Relaxed),
            last_refresh_failed: self.last_refresh_failed.load(Ordering::Relaxed),
        }
    }

    pub async fn clear(&self) {
        *self.entry.write().await = None;
    }
}

fn lookup(slots: Vec<Slot>, freshness: SlotFreshness) -> SlotLookup {
    SlotLookup { slots, freshness }
}

pub fn filter_by_range(
    slots: &[Slot],
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> Vec<Slot> {
    slots.iter().filter(|slot| slot.starts_within(range_start, range_end)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use super::{filter_by_range, SlotCache, SlotFreshness};
    use crate::clock::ManualClock;
    use crate::domain::slot::Slot;

    fn slots_from(start: DateTime<Utc>, count: i64) -> Vec<Slot> {
        (0..count)
            .map(|offset| {
                let begin = start + Duration::hours(offset * 24);
                Slot { start: begin, end: begin + Duration::minutes(30) }
            })
            .collect()
    }

    fn cache(clock: Arc<ManualClock>) -> SlotCache {
        SlotCache::new(Duration::minutes(15), std::time::Duration::from_secs(5), clock)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let clock = Arc::new(ManualClock::default());
        let now = clock_now(&clock);
        let cache = cache(clock.clone());
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let fetch = |_, _| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            Ok::<_, String>(slots_from(now, 3))
        };
        let horizon = now + Duration::days(7);
        let (first, second) = tokio::join!(
            cache.get_or_refresh(now, horizon, fetch),
            cache.get_or_refresh(now, horizon, fetch)
        );

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(first.slots.len(), 3);
        assert_eq!(second.slots, first.slots);
        assert_eq!(first.freshness, SlotFreshness::Refreshed);
        assert_eq!(second.freshness, SlotFreshness::Cached);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_slots() {
        let clock = Arc::new(ManualClock::default());
        let now = clock_now(&clock);
        let cache = cache(clock.clone());
        let horizon = now + Duration::days(7);

        cache.get_or_refresh(now, horizon, |_, _| async move { Ok::<_, String>(slots_from(now, 2)) }).await;
        clock.advance(Duration::minutes(16));

        let lookup = cache
            .get_or_refresh(now, horizon, |_, _| async move { Err::<Vec<Slot>, _>("502 bad gateway") })
            .await;

        assert_eq!(lookup.freshness, SlotFreshness::Stale);
        assert_eq!(lookup.slots.len(), 2);
        let stats = cache.stats().await;
        assert!(stats.last_refresh_failed);
        assert_eq!(stats.fetches, 2);
    }

    #[tokio::test]
    async fn failure_without_previous_value_is_unavailable_not_an_error() {
        let clock = Arc::new(ManualClock::default());
        let now = clock_now(&clock);
        let cache = cache(clock);

        let lookup = cache
            .get_or_refresh(now, now + Duration::days(7), |_, _| async move {
                Err::<Vec<Slot>, _>("timeout")
            })
            .await;

        assert_eq!(lookup.freshness, SlotFreshness::Unavailable);
        assert!(lookup.slots.is_empty());
    }

    #[tokio::test]
    async fn cleared_cache_refetches() {
        let clock = Arc::new(ManualClock::default());
        let now = clock_now(&clock);
        let cache = cache(clock);
        let horizon = now + Duration::days(7);

        cache.get_or_refresh(now, horizon, |_, _| async move { Ok::<_, String>(slots_from(now, 1)) }).await;
        cache.clear().await;
        let lookup =
            cache.get_or_refresh(now, horizon, |_, _| async move { Ok::<_, String>(slots_from(now, 4)) }).await;

        assert_eq!(lookup.freshness, SlotFreshness::Refreshed);
        assert_eq!(lookup.slots.len(), 4);
    }

    #[tokio::test]
    async fn range_outside_the_cached_window_is_fetched() {
        let clock = Arc::new(ManualClock::default());
        let now = clock_now(&clock);
        let cache = cache(clock);
        let later = now + Duration::days(10);

        let first = cache
            .get_or_refresh(now, now + Duration::days(7), |_, _| async move {
                Ok::<_, String>(slots_from(now + Duration::hours(1), 1))
            })
            .await;
        let second = cache
            .get_or_refresh(later, later + Duration::days(3), |from, _| async move {
                Ok::<_, String>(slots_from(from + Duration::hours(1), 2))
            })
            .await;

        assert_eq!(first.slots.len(), 1);
        assert_eq!(second.freshness, SlotFreshness::Refreshed);
        assert_eq!(second.slots.len(), 2);
        assert_eq!(cache.stats().await.fetches, 2);
    }

    #[tokio::test]
    async fn rolling_default_range_stays_cached_within_the_ttl() {
        let clock = Arc::new(ManualClock::default());
        let now = clock_now(&clock);
        let cache = cache(clock.clone());
        let requested = std::sync::Mutex::new(None);
        let seen = &requested;

        cache
            .get_or_refresh(now, now + Duration::days(7), |from, to| async move {
                *seen.lock().unwrap() = Some((from, to));
                Ok::<_, String>(slots_from(now + Duration::hours(1), 3))
            })
            .await;
        clock.advance(Duration::minutes(10));
        let moved = clock_now(&clock);
        let lookup = cache
            .get_or_refresh(moved, moved + Duration::days(7), |_, _| async move {
                Ok::<_, String>(Vec::new())
            })
            .await;

        assert_eq!(*requested.lock().unwrap(), Some((now, now + Duration::days(7) + Duration::minutes(15))));
        assert_eq!(lookup.freshness, SlotFreshness::Cached);
        assert_eq!(lookup.slots.len(), 3);
        assert_eq!(cache.stats().await.fetches, 1);
    }

    #[test]
    fn range_filter_uses_slot_start() {
        let now = Utc::now();
        let slots = slots_from(now, 5);
        let filtered = filter_by_range(&slots, now + Duration::days(1), now + Duration::days(3));
        assert_eq!(filtered.len(), 3);
    }

    fn clock_now(clock: &ManualClock) -> DateTime<Utc> {
        use crate::clock::Clock;
        clock.now()
    }
}
