//! In-memory set store with Redis key semantics

use super::{ScoreBound, SetStore, SortedSet, StoreError, StoreResult};
use crate::clock::{SharedClock, SystemClock};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
enum StoredValue {
    String(String),
    SortedSet(SortedSet),
}

#[derive(Debug, Default)]
struct Keyspace {
    data: AHashMap<String, StoredValue>,
    /// Absolute expiry in clock milliseconds
    expirations: AHashMap<String, u64>,
}

impl Keyspace {
    fn is_expired(&self, key: &str, now_ms: u64) -> bool {
        self.expirations
            .get(key)
            .map(|at| *at <= now_ms)
            .unwrap_or(false)
    }

    fn purge_if_expired(&mut self, key: &str, now_ms: u64) {
        if self.is_expired(key, now_ms) {
            self.data.remove(key);
            self.expirations.remove(key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expirations.remove(key);
        self.data.remove(key).is_some()
    }

    fn live(&self, key: &str, now_ms: u64) -> Option<&StoredValue> {
        if self.is_expired(key, now_ms) {
            None
        } else {
            self.data.get(key)
        }
    }
}

/// In-process [`SetStore`].
///
/// A single `RwLock` guards the keyspace, which makes every trait call, and
/// in particular `atomic_update`, linearizable. Expired keys are hidden from
/// readers immediately and physically removed on the next write to the key or
/// by [`SetStore::evict_expired`].
pub struct InMemorySetStore {
    keyspace: RwLock<Keyspace>,
    clock: SharedClock,
}

impl Default for InMemorySetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySetStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        InMemorySetStore {
            keyspace: RwLock::new(Keyspace::default()),
            clock,
        }
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_millis();
        let keyspace = self.keyspace.read();
        keyspace
            .data
            .keys()
            .filter(|k| !keyspace.is_expired(k, now))
            .count()
    }

    fn read_zset<R>(&self, key: &str, f: impl FnOnce(&SortedSet) -> R) -> StoreResult<Option<R>> {
        let now = self.clock.now_millis();
        let keyspace = self.keyspace.read();
        match keyspace.live(key, now) {
            Some(StoredValue::SortedSet(zset)) => Ok(Some(f(zset))),
            Some(StoredValue::String(_)) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    fn write_zset<R>(&self, key: &str, f: impl FnOnce(&mut SortedSet) -> R) -> StoreResult<R> {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.write();
        keyspace.purge_if_expired(key, now);
        let value = keyspace
            .data
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::SortedSet(SortedSet::new()));
        let (result, now_empty) = match value {
            StoredValue::SortedSet(zset) => {
                let result = f(zset);
                (result, zset.is_empty())
            }
            StoredValue::String(_) => {
                return Err(StoreError::WrongType {
                    key: key.to_string(),
                })
            }
        };
        if now_empty {
            keyspace.remove(key);
        }
        Ok(result)
    }
}

impl SetStore for InMemorySetStore {
    fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        self.write_zset(key, |zset| zset.add(member, score))
    }

    fn zadd_gt(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        self.write_zset(key, |zset| zset.add_if_greater(member, score))
    }

    fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.write_zset(key, |zset| zset.remove(member))
    }

    fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        Ok(self.read_zset(key, |zset| zset.score(member))?.flatten())
    }

    fn zcard(&self, key: &str) -> StoreResult<usize> {
        Ok(self.read_zset(key, |zset| zset.len())?.unwrap_or(0))
    }

    fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, f64)>> {
        Ok(self
            .read_zset(key, |zset| zset.rev_range(start, stop))?
            .unwrap_or_default())
    }

    fn zrevrangebyscore(
        &self,
        key: &str,
        max: ScoreBound,
        min: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        Ok(self
            .read_zset(key, |zset| zset.rev_range_by_score(max, min, limit))?
            .unwrap_or_default())
    }

    fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> StoreResult<usize> {
        self.write_zset(key, |zset| zset.remove_range_by_rank(start, stop))
    }

    fn del(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.write();
        keyspace.purge_if_expired(key, now);
        Ok(keyspace.remove(key))
    }

    fn incrby(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.write();
        keyspace.purge_if_expired(key, now);
        let current = match keyspace.data.get(key) {
            Some(StoredValue::String(s)) => s.parse::<i64>().map_err(|_| StoreError::NotInteger {
                key: key.to_string(),
            })?,
            Some(StoredValue::SortedSet(_)) => {
                return Err(StoreError::WrongType {
                    key: key.to_string(),
                })
            }
            None => 0,
        };
        let updated = current.checked_add(delta).ok_or(StoreError::NotInteger {
            key: key.to_string(),
        })?;
        keyspace
            .data
            .insert(key.to_string(), StoredValue::String(updated.to_string()));
        Ok(updated)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.write();
        keyspace.purge_if_expired(key, now);
        if !keyspace.data.contains_key(key) {
            return Ok(false);
        }
        let at = now.saturating_add(ttl.as_millis() as u64);
        keyspace.expirations.insert(key.to_string(), at);
        Ok(true)
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_millis();
        let keyspace = self.keyspace.read();
        match keyspace.live(key, now) {
            Some(StoredValue::String(s)) => Ok(Some(s.clone())),
            Some(StoredValue::SortedSet(_)) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut keyspace = self.keyspace.write();
        keyspace.expirations.remove(key);
        keyspace
            .data
            .insert(key.to_string(), StoredValue::String(value.to_string()));
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now_millis();
        let keyspace = self.keyspace.read();
        let mut keys: Vec<String> = keyspace
            .data
            .keys()
            .filter(|k| k.starts_with(prefix) && !keyspace.is_expired(k, now))
            .cloned()
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    fn atomic_update(
        &self,
        keys: &[String],
        op: &mut dyn FnMut(&mut [SortedSet]),
    ) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.write();

        for key in keys {
            keyspace.purge_if_expired(key, now);
            if let Some(StoredValue::String(_)) = keyspace.data.get(key) {
                return Err(StoreError::WrongType { key: key.clone() });
            }
        }

        let mut sets: Vec<SortedSet> = keys
            .iter()
            .map(|key| match keyspace.data.remove(key) {
                Some(StoredValue::SortedSet(zset)) => zset,
                _ => SortedSet::new(),
            })
            .collect();

        op(&mut sets);

        for (key, zset) in keys.iter().zip(sets) {
            if zset.is_empty() {
                keyspace.remove(key);
            } else {
                keyspace
                    .data
                    .insert(key.clone(), StoredValue::SortedSet(zset));
            }
        }
        Ok(())
    }

    fn evict_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.write();
        let expired: Vec<String> = keyspace
            .expirations
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            keyspace.remove(key);
        }
        if !expired.is_empty() {
            debug!("Evicted {} expired keys", expired.len());
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;

    #[test]
    fn test_zadd_zrem_leaves_empty_key_removed() {
        let store = InMemorySetStore::new();
        assert!(store.zadd("k", 1.0, "a").unwrap());
        assert!(store.zrem("k", "a").unwrap());
        assert_eq!(store.zcard("k").unwrap(), 0);
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn test_wrong_type() {
        let store = InMemorySetStore::new();
        store.set("s", "value").unwrap();
        assert_eq!(
            store.zadd("s", 1.0, "a"),
            Err(StoreError::WrongType { key: "s".into() })
        );
        store.zadd("z", 1.0, "a").unwrap();
        assert!(store.get("z").is_err());
    }

    #[test]
    fn test_incr() {
        let store = InMemorySetStore::new();
        assert_eq!(store.incr("n").unwrap(), 1);
        assert_eq!(store.incrby("n", 41).unwrap(), 42);
        assert_eq!(store.get("n").unwrap(), Some("42".to_string()));

        store.set("text", "abc").unwrap();
        assert!(matches!(
            store.incr("text"),
            Err(StoreError::NotInteger { .. })
        ));
    }

    #[test]
    fn test_expire_hides_then_evicts() {
        let clock = SimulatedClock::new(10_000);
        let store = InMemorySetStore::with_clock(Arc::new(clock.clone()));

        store.zadd("tmp", 1.0, "a").unwrap();
        assert!(store.expire("tmp", Duration::from_secs(5)).unwrap());
        assert!(!store.expire("missing", Duration::from_secs(5)).unwrap());

        clock.advance_ms(4_999);
        assert_eq!(store.zcard("tmp").unwrap(), 1);

        clock.advance_ms(1);
        assert_eq!(store.zcard("tmp").unwrap(), 0);
        assert_eq!(store.evict_expired(), 1);
        assert_eq!(store.evict_expired(), 0);
    }

    #[test]
    fn test_keys_with_prefix_skips_expired() {
        let clock = SimulatedClock::new(0);
        let store = InMemorySetStore::with_clock(Arc::new(clock.clone()));
        store.zadd("flux:set:b", 1.0, "m").unwrap();
        store.zadd("flux:set:a", 1.0, "m").unwrap();
        store.zadd("flux:gross:a", 1.0, "m").unwrap();
        store.zadd("flux:set:tmp", 1.0, "m").unwrap();
        store.expire("flux:set:tmp", Duration::from_secs(1)).unwrap();
        clock.advance_ms(1_000);

        assert_eq!(
            store.keys_with_prefix("flux:set:").unwrap(),
            vec!["flux:set:a", "flux:set:b"]
        );
        assert!(store.keys_with_prefix("flux:distinct:").unwrap().is_empty());
    }

    #[test]
    fn test_set_clears_expiration() {
        let clock = SimulatedClock::new(0);
        let store = InMemorySetStore::with_clock(Arc::new(clock.clone()));
        store.set("k", "1").unwrap();
        store.expire("k", Duration::from_millis(10)).unwrap();
        store.set("k", "2").unwrap();
        clock.advance_ms(100);
        assert_eq!(store.get("k").unwrap(), Some("2".to_string()));
    }

    #[test]
    fn test_atomic_update_multiple_keys() {
        let store = InMemorySetStore::new();
        store.zadd("a", 1.0, "x").unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        store
            .atomic_update(&keys, &mut |sets| {
                let score = sets[0].score("x").unwrap_or(0.0);
                sets[0].remove("x");
                sets[1].add("x", score + 1.0);
            })
            .unwrap();

        assert_eq!(store.zcard("a").unwrap(), 0);
        assert_eq!(store.zscore("b", "x").unwrap(), Some(2.0));
    }

    #[test]
    fn test_atomic_update_rejects_string_key() {
        let store = InMemorySetStore::new();
        store.set("s", "v").unwrap();
        let result = store.atomic_update(&["s".to_string()], &mut |_| {});
        assert!(matches!(result, Err(StoreError::WrongType { .. })));
        assert_eq!(store.get("s").unwrap(), Some("v".to_string()));
    }
}
