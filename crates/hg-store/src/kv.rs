//! Key-value collaborator with per-entry time-to-live

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a live value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, replacing any existing one
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Store a value only if no live value exists.
    /// Returns true when this call created the entry.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Replace a live value only while it still equals `expected`.
    /// Returns true when the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Remove a live value only while it still equals `expected`
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    /// Atomically read and remove a value
    async fn take(&self, key: &str) -> Result<Option<String>>;

    /// Remove a value. Returns true if a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Backend name
    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

impl StoredValue {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process store for single-instance deployments and tests.
/// Expired entries are dropped lazily on access and by `purge_expired`.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, including not-yet-purged expired ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        // Shard guard from `get` is released above; removing here cannot deadlock
        self.entries.remove_if(key, |_, v| !v.is_live(now));
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        // The entry guard holds the shard lock, making check-and-insert atomic
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(StoredValue::new(value, ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && entry.value == expected => {
                *entry = StoredValue::new(value, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, v| v.is_live(now) && v.value == expected)
            .is_some())
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .filter(|(_, v)| v.is_live(now))
            .map(|(_, v)| v.value))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, v)| v.is_live(now))
            .unwrap_or(false))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryKvStore::new();
        store.put("k", "v", TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        assert!(store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let store = MemoryKvStore::new();
        assert!(store.put_if_absent("k", "first", TTL).await.unwrap());
        assert!(!store.put_if_absent("k", "second", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let store = MemoryKvStore::new();
        store.put("k", "v", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.put_if_absent("k", "new", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_take_is_single_use() {
        let store = MemoryKvStore::new();
        store.put("state", "payload", TTL).await.unwrap();
        assert_eq!(store.take("state").await.unwrap(), Some("payload".to_string()));
        assert_eq!(store.take("state").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_swap_requires_current_value() {
        let store = MemoryKvStore::new();
        store.put("k", "owner-a", TTL).await.unwrap();

        assert!(!store.compare_and_swap("k", "owner-b", "done", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("owner-a".to_string()));

        assert!(store.compare_and_swap("k", "owner-a", "done", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("done".to_string()));

        assert!(!store.compare_and_swap("missing", "x", "y", TTL).await.unwrap());
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_swap_ignores_expired_value() {
        let store = MemoryKvStore::new();
        store.put("k", "owner-a", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!store.compare_and_swap("k", "owner-a", "done", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_if_eq_keeps_other_owner() {
        let store = MemoryKvStore::new();
        store.put("k", "owner-b", TTL).await.unwrap();

        assert!(!store.delete_if_eq("k", "owner-a").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("owner-b".to_string()));

        assert!(store.delete_if_eq("k", "owner-b").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryKvStore::new();
        store.put("short", "v", Duration::from_millis(10)).await.unwrap();
        store.put("long", "v", TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_put_if_absent_single_winner() {
        let store = Arc::new(MemoryKvStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.put_if_absent("race", &i.to_string(), TTL).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
