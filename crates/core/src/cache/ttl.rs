use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::clock::SharedClock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry<V> {
    pub value: V,
    pub stored_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, stored_at: DateTime<Utc>) -> Self {
        Self { value, stored_at }
    }

    /// Valid only while `now - stored_at < ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.stored_at < ttl
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.stored_at
    }
}

/// Process-wide keyed cache with lazy expiry. Reads share a lock; writes are
/// serialized.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
    clock: SharedClock,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self { entries: RwLock::new(HashMap::new()), ttl, clock }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_fresh(now, self.ttl) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| !entry.is_fresh(now, self.ttl)) {
            entries.remove(key);
        }
        None
    }

    pub async fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        self.entries.write().await.insert(key, CacheEntry::new(value, now));
    }

    /// Inserts `value` unless a fresh entry already exists, in which case the
    /// existing value is returned and nothing changes. Check and insert happen
    /// under one write lock.
    pub async fn insert_if_absent(&self, key: K, value: V) -> Result<(), V> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&key) {
            if existing.is_fresh(now, self.ttl) {
                return Err(existing.value.clone());
            }
        }
        entries.insert(key, CacheEntry::new(value, now));
        Ok(())
    }

    /// Replaces the value of an existing entry and restarts its TTL.
    pub async fn replace(&self, key: &K, value: V) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) => {
                *entry = CacheEntry::new(value, now);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().await.remove(key).map(|entry| entry.value)
    }

    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now, self.ttl));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
