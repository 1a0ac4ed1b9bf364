//! Time-bounded in-process cache shared by the recommendation paths.
//!
//! Entries are only ever dropped by TTL or by an explicit [`TtlCache::flush`];
//! rule writes do not invalidate anything here.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(HashMap::new()) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Stores `value`, evicting expired entries on the way.
    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        entries.insert(key, Entry { value, stored_at: Instant::now() });
    }

    /// Drops every entry. Returns how many were held.
    pub async fn flush(&self) -> usize {
        let mut entries = self.entries.write().await;
        let flushed = entries.len();
        entries.clear();
        flushed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TtlCache;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.insert("rifles", vec![1_u64, 2]).await;
        assert_eq!(cache.get(&"rifles").await, Some(vec![1, 2]));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&"rifles").await, None);
    }

    #[tokio::test]
    async fn flush_drops_everything() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert(1_u64, "a").await;
        cache.insert(2_u64, "b").await;

        assert_eq!(cache.flush().await, 2);
        assert!(cache.is_empty().await);
        assert_eq!(cache.get(&1).await, None);
    }
}
