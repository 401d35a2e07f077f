use super::CacheStore;
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Stored value shapes
#[derive(Debug, Clone)]
enum MemoryValue {
    Text(String),
    Counter(i64),
    /// (score, member) pairs kept ordered by score
    Sorted(Vec<(i64, String)>),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: MemoryValue,
    expires_at_ms: Option<i64>,
}

impl MemoryEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(false, |at| at <= now_ms)
    }

    fn pttl(&self, now_ms: i64) -> i64 {
        self.expires_at_ms.map_or(-1, |at| (at - now_ms).max(0))
    }
}

/// In-process store with the same key and expiry semantics as Redis.
///
/// Not shared across processes; suitable for development, single-instance
/// deployments and tests.
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired in-memory store entries");
        }
        removed
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drop_if_expired(&self, key: &str, now_ms: i64) {
        self.entries.remove_if(key, |_, entry| entry.is_expired(now_ms));
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn evict_expired(&self) -> usize {
        self.purge_expired()
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_ms();
        self.drop_if_expired(key, now);

        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                MemoryValue::Text(text) => Ok(Some(text.clone())),
                MemoryValue::Counter(count) => Ok(Some(count.to_string())),
                MemoryValue::Sorted(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_ms();
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Text(value.to_string()),
                expires_at_ms: Some(now + ttl.as_millis().max(1) as i64),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let now = self.clock.now_ms();
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn incr_with_pttl(&self, key: &str) -> StoreResult<(i64, i64)> {
        let now = self.clock.now_ms();
        self.drop_if_expired(key, now);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: MemoryValue::Counter(0),
                expires_at_ms: None,
            });

        let count = match &entry.value {
            MemoryValue::Counter(count) => count + 1,
            MemoryValue::Text(text) => text
                .parse::<i64>()
                .map_err(|_| StoreError::WrongType(key.to_string()))?
                + 1,
            MemoryValue::Sorted(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        entry.value = MemoryValue::Counter(count);

        Ok((count, entry.pttl(now)))
    }

    async fn pexpire(&self, key: &str, ttl_ms: i64) -> StoreResult<bool> {
        let now = self.clock.now_ms();
        self.drop_if_expired(key, now);

        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at_ms = Some(now + ttl_ms);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pttl(&self, key: &str) -> StoreResult<i64> {
        let now = self.clock.now_ms();
        self.drop_if_expired(key, now);

        Ok(self.entries.get(key).map_or(-2, |entry| entry.pttl(now)))
    }

    async fn zpurge_and_count(&self, key: &str, min_score: i64) -> StoreResult<u64> {
        let now = self.clock.now_ms();
        self.drop_if_expired(key, now);

        let count = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                MemoryValue::Sorted(members) => {
                    members.retain(|(score, _)| *score >= min_score);
                    members.len() as u64
                }
                _ => return Err(StoreError::WrongType(key.to_string())),
            },
            None => 0,
        };

        // Redis deletes a sorted set once its last member is gone
        self.entries.remove_if(key, |_, entry| {
            matches!(&entry.value, MemoryValue::Sorted(members) if members.is_empty())
        });

        Ok(count)
    }

    async fn zadd_with_pexpire(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl_ms: i64,
    ) -> StoreResult<()> {
        let now = self.clock.now_ms();
        self.drop_if_expired(key, now);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: MemoryValue::Sorted(Vec::new()),
                expires_at_ms: None,
            });

        match &mut entry.value {
            MemoryValue::Sorted(members) => {
                members.retain(|(_, existing)| existing != member);
                let at = members.partition_point(|(s, _)| *s <= score);
                members.insert(at, (score, member.to_string()));
            }
            _ => return Err(StoreError::WrongType(key.to_string())),
        }
        entry.expires_at_ms = Some(now + ttl_ms);

        Ok(())
    }

    async fn zmembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now_ms();
        self.drop_if_expired(key, now);

        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                MemoryValue::Sorted(members) => {
                    Ok(members.iter().map(|(_, m)| m.clone()).collect())
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now_ms();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now) && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Redis-style glob matching supporting `*`, `?` and backslash escapes
fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    glob_match_from(&pattern, &key)
}

fn glob_match_from(pattern: &[char], key: &[char]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some('*') => {
            let rest = &pattern[1..];
            (0..=key.len()).any(|skip| glob_match_from(rest, &key[skip..]))
        }
        Some('?') => !key.is_empty() && glob_match_from(&pattern[1..], &key[1..]),
        Some('\\') if pattern.len() > 1 => {
            key.first() == Some(&pattern[1]) && glob_match_from(&pattern[2..], &key[1..])
        }
        Some(c) => key.first() == Some(c) && glob_match_from(&pattern[1..], &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(start_ms: i64) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        (MemoryStore::new(clock.clone()), clock)
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("user:*", "user:42:GET:/api"));
        assert!(!glob_match("user:*", "hot:GET:/api"));
        assert!(glob_match("user:*:GET:/api/v1/teams*", "user:7:GET:/api/v1/teams/3"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("a\\*c", "a*c"));
        assert!(!glob_match("a\\*c", "abc"));
        assert!(glob_match("*", ""));
    }

    #[tokio::test]
    async fn test_set_get_and_expiry() {
        let (store, clock) = store_at(0);

        store
            .set_ex("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.pttl("k").await.unwrap(), 10_000);

        clock.advance(10_000);
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.pttl("k").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_counter_ttl_is_not_refreshed_by_increment() {
        let (store, clock) = store_at(0);

        let (count, ttl) = store.incr_with_pttl("c").await.unwrap();
        assert_eq!((count, ttl), (1, -1));
        assert!(store.pexpire("c", 60_000).await.unwrap());

        clock.advance(59_000);
        let (count, ttl) = store.incr_with_pttl("c").await.unwrap();
        assert_eq!((count, ttl), (2, 1_000));

        clock.advance(1_000);
        let (count, ttl) = store.incr_with_pttl("c").await.unwrap();
        assert_eq!((count, ttl), (1, -1));
    }

    #[tokio::test]
    async fn test_sorted_set_purge() {
        let (store, _clock) = store_at(0);

        store.zadd_with_pexpire("w", 0, "a", 60_000).await.unwrap();
        store.zadd_with_pexpire("w", 59_999, "b", 60_000).await.unwrap();
        assert_eq!(store.zmembers("w").await.unwrap(), vec!["a", "b"]);

        // Entries scored exactly at the bound are kept
        assert_eq!(store.zpurge_and_count("w", 0).await.unwrap(), 2);
        assert_eq!(store.zpurge_and_count("w", 1).await.unwrap(), 1);
        assert_eq!(store.zmembers("w").await.unwrap(), vec!["b"]);

        assert_eq!(store.zpurge_and_count("w", 100_000).await.unwrap(), 0);
        assert_eq!(store.pttl("w").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let (store, _clock) = store_at(0);
        store.zadd_with_pexpire("w", 1, "a", 1_000).await.unwrap();

        assert!(matches!(
            store.get("w").await,
            Err(StoreError::WrongType(_))
        ));
        assert!(store.incr_with_pttl("w").await.is_err());
    }

    #[tokio::test]
    async fn test_scan_and_del() {
        let (store, clock) = store_at(0);
        let ttl = Duration::from_secs(60);

        store.set_ex("user:A:profile", "1", ttl).await.unwrap();
        store.set_ex("user:AB:profile", "2", ttl).await.unwrap();
        store.set_ex("user:B:profile", "3", ttl).await.unwrap();
        store.set_ex("hot:GET:/x", "4", Duration::from_secs(1)).await.unwrap();

        let keys = store.scan_keys("user:A*").await.unwrap();
        assert_eq!(keys, vec!["user:A:profile", "user:AB:profile"]);

        assert_eq!(store.del(&keys).await.unwrap(), 2);
        assert_eq!(store.len(), 2);

        clock.advance(1_000);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
