/*!
 * In-Memory Storage Implementation
 *
 * One `Store` is one shard of the keyspace. It is owned by exactly one worker
 * thread, so nothing in here is synchronized except the process-wide
 * keyspace counters.
 *
 * Values and expiry deadlines live in two separate maps. A key without an
 * entry in `expirations` never expires; every key in `expirations` also has
 * an entry in `entries`.
 */

use crate::clock::now_ms;
use crate::config::{EvictionPolicy, StoreConfig};
use crate::eviction::EvictionPool;
use bytes::Bytes;
use log::{debug, trace};
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type AHash = BuildHasherDefault<ahash::AHasher>;

/// Member storage for set values
pub type MemberSet = HashSet<Bytes, AHash>;

/// Keys sampled per active-expiration round
const EXPIRE_SAMPLE_SIZE: usize = 20;
/// Another round runs if at least this share of the sample had expired
const EXPIRE_REPEAT_THRESHOLD: f64 = 0.25;
/// Upper bound on rounds so one cycle cannot monopolize the shard
const EXPIRE_MAX_ROUNDS: usize = 16;

/// Values a key can hold
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String/binary data
    Str(Bytes),
    /// Unordered set of members
    Set(MemberSet),
}

/// A stored value with its bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    /// Monotonic milliseconds of the last read or write
    pub last_access: u64,
}

/// Remaining lifetime of a key, as seen by TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Missing,
    Persistent,
    /// Milliseconds left
    Remaining(u64),
}

/// Process-wide keyspace counters, shared by every shard
#[derive(Debug, Default)]
pub struct KeyspaceStats {
    keys: AtomicUsize,
    expires: AtomicUsize,
}

impl KeyspaceStats {
    /// Keys across all shards, including expired keys not yet reclaimed
    pub fn keys(&self) -> usize {
        self.keys.load(Ordering::Relaxed)
    }

    /// Keys that currently carry an expiry
    pub fn expires(&self) -> usize {
        self.expires.load(Ordering::Relaxed)
    }
}

/// A single shard of the keyspace
pub struct Store {
    entries: HashMap<Bytes, Entry, AHash>,
    expirations: HashMap<Bytes, u64, AHash>,
    config: StoreConfig,
    stats: Arc<KeyspaceStats>,
}

impl Store {
    /// Create an empty shard
    ///
    /// # Arguments
    /// * `config` - Capacity and eviction settings for this shard
    /// * `stats` - Counters shared with every other shard of the process
    pub fn new(config: StoreConfig, stats: Arc<KeyspaceStats>) -> Self {
        Self {
            entries: HashMap::default(),
            expirations: HashMap::default(),
            config,
            stats,
        }
    }

    /// Process-wide counters this shard reports into
    pub fn stats(&self) -> &Arc<KeyspaceStats> {
        &self.stats
    }

    /// Number of keys held, including expired keys not yet reclaimed
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the shard holds no keys at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a key, refreshing its access time
    ///
    /// An expired key is deleted on the spot and reported as absent.
    ///
    /// # Arguments
    /// * `key` - Key to lookup as byte slice
    ///
    /// # Returns
    /// * `Some(&Entry)` if the key exists and is live
    /// * `None` if it is missing or has just expired
    pub fn get(&mut self, key: &[u8]) -> Option<&Entry> {
        self.get_mut(key).map(|e| &*e)
    }

    /// Mutable variant of [`Store::get`], for handlers that update values in place
    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Entry> {
        if self.has_expired(key) {
            self.delete(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_access = now_ms();
        Some(entry)
    }

    /// Whether a live key exists; same side effects as [`Store::get`]
    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite a key
    ///
    /// A `ttl_ms` of zero or less leaves any existing expiry untouched and
    /// gives a new key no expiry. A full shard runs one eviction pass before
    /// a new key is inserted.
    ///
    /// # Arguments
    /// * `key` - Key as owned bytes
    /// * `value` - Value to store
    /// * `ttl_ms` - Time to live in milliseconds; `<= 0` sets none
    pub fn set(&mut self, key: Bytes, value: Value, ttl_ms: i64) {
        // an overwrite of a dead key is a fresh insert, not an update
        if self.has_expired(&key) {
            self.delete(&key);
        }

        let now = now_ms();
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.last_access = now;
        } else {
            if self.entries.len() >= self.config.max_keys {
                self.evict();
            }
            self.entries.insert(
                key.clone(),
                Entry {
                    value,
                    last_access: now,
                },
            );
            self.stats.keys.fetch_add(1, Ordering::Relaxed);
        }

        if ttl_ms > 0 {
            self.set_expiry(&key, ttl_ms);
        }
    }

    /// Remove a key and its expiry
    ///
    /// # Returns
    /// * `true` if the key existed and was deleted
    /// * `false` if it was not present
    pub fn delete(&mut self, key: &[u8]) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        if self.expirations.remove(key).is_some() {
            self.stats.expires.fetch_sub(1, Ordering::Relaxed);
        }
        self.stats.keys.fetch_sub(1, Ordering::Relaxed);
        trace!("deleted key {:?}", String::from_utf8_lossy(key));
        true
    }

    /// Whether the key's recorded deadline has passed. Never mutates.
    #[inline]
    pub fn has_expired(&self, key: &[u8]) -> bool {
        match self.expirations.get(key) {
            Some(&deadline) => deadline <= now_ms(),
            None => false,
        }
    }

    /// Set the key to expire `ttl_ms` from now; `false` if the key does not exist
    pub fn set_expiry(&mut self, key: &[u8], ttl_ms: i64) -> bool {
        let Some((owned, _)) = self.entries.get_key_value(key) else {
            return false;
        };
        let deadline = now_ms().saturating_add(ttl_ms.max(0) as u64);
        if self.expirations.insert(owned.clone(), deadline).is_none() {
            self.stats.expires.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Absolute deadline in monotonic milliseconds, if any
    pub fn expiry(&self, key: &[u8]) -> Option<u64> {
        self.expirations.get(key).copied()
    }

    /// Remaining lifetime of a key
    ///
    /// Expired keys are reclaimed first, so they report [`Ttl::Missing`].
    ///
    /// # Returns
    /// * `Ttl::Missing` if there is no live key
    /// * `Ttl::Persistent` if the key never expires
    /// * `Ttl::Remaining(ms)` otherwise
    pub fn ttl(&mut self, key: &[u8]) -> Ttl {
        if self.get(key).is_none() {
            return Ttl::Missing;
        }
        match self.expiry(key) {
            None => Ttl::Persistent,
            Some(deadline) => Ttl::Remaining(deadline.saturating_sub(now_ms())),
        }
    }

    /// Run the configured eviction policy once
    ///
    /// Returns how many keys were removed.
    pub fn evict(&mut self) -> usize {
        let evicted = match self.config.eviction_policy {
            EvictionPolicy::AllKeysRandom => self.evict_random(),
            EvictionPolicy::AllKeysLru => self.evict_lru(),
        };
        debug!(
            "{:?} eviction removed {} keys ({} left)",
            self.config.eviction_policy,
            evicted,
            self.entries.len()
        );
        evicted
    }

    /// Delete up to the quota in the map's own iteration order
    fn evict_random(&mut self) -> usize {
        let victims: Vec<Bytes> = self
            .entries
            .keys()
            .take(self.config.eviction_quota())
            .cloned()
            .collect();
        let mut evicted = 0;
        for key in &victims {
            if self.delete(key) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Sample keys into a candidate pool and delete from its oldest end
    fn evict_lru(&mut self) -> usize {
        let mut pool = EvictionPool::with_capacity(self.config.lru_sample_size);
        let mut rng = rand::thread_rng();
        for (key, entry) in self
            .entries
            .iter()
            .choose_multiple(&mut rng, self.config.lru_sample_size)
        {
            pool.push(key.clone(), entry.last_access);
        }

        let quota = self.config.eviction_quota();
        let mut evicted = 0;
        while evicted < quota {
            let Some(candidate) = pool.pop() else { break };
            if self.delete(&candidate.key) {
                evicted += 1;
            }
        }
        evicted
    }

    /// One active-expiration cycle: sample keys with a deadline and drop the dead ones
    ///
    /// Keeps sampling while a quarter or more of the sample was expired.
    /// Returns the number of keys removed.
    pub fn active_expire_cycle(&mut self) -> usize {
        let mut rng = rand::thread_rng();
        let mut removed = 0;

        for _ in 0..EXPIRE_MAX_ROUNDS {
            if self.expirations.is_empty() {
                break;
            }
            let now = now_ms();
            let sample = self
                .expirations
                .iter()
                .choose_multiple(&mut rng, EXPIRE_SAMPLE_SIZE);
            let sampled = sample.len();
            let dead: Vec<Bytes> = sample
                .into_iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(k, _)| k.clone())
                .collect();

            for key in &dead {
                self.delete(key);
            }
            removed += dead.len();

            if (dead.len() as f64) < sampled as f64 * EXPIRE_REPEAT_THRESHOLD {
                break;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn store(max_keys: usize, policy: EvictionPolicy) -> Store {
        let config = StoreConfig {
            max_keys,
            eviction_ratio: 0.1,
            eviction_policy: policy,
            lru_sample_size: max_keys,
        };
        Store::new(config, Arc::new(KeyspaceStats::default()))
    }

    fn s(v: &'static str) -> Value {
        Value::Str(Bytes::from_static(v.as_bytes()))
    }

    #[test]
    fn set_then_get_returns_last_write() {
        let mut st = store(100, EvictionPolicy::AllKeysRandom);
        st.set(Bytes::from("k"), s("1"), 0);
        st.set(Bytes::from("k"), s("2"), 0);
        assert_eq!(st.get(b"k").unwrap().value, s("2"));
        assert_eq!(st.stats().keys(), 1);
    }

    #[test]
    fn lazy_expiry_removes_from_both_maps() {
        let mut st = store(100, EvictionPolicy::AllKeysRandom);
        st.set(Bytes::from("k"), s("v"), 20);
        assert!(!st.has_expired(b"k"));
        sleep(Duration::from_millis(40));
        assert!(st.has_expired(b"k"));
        // has_expired is a pure check
        assert_eq!(st.len(), 1);

        assert!(st.get(b"k").is_none());
        assert_eq!(st.len(), 0);
        assert_eq!(st.expiry(b"k"), None);
        assert_eq!(st.stats().keys(), 0);
        assert_eq!(st.stats().expires(), 0);
    }

    #[test]
    fn overwrite_without_ttl_keeps_existing_expiry() {
        let mut st = store(100, EvictionPolicy::AllKeysRandom);
        st.set(Bytes::from("k"), s("v"), 60_000);
        st.set(Bytes::from("k"), s("w"), 0);
        assert!(st.expiry(b"k").is_some());
        st.set(Bytes::from("k"), s("x"), -5);
        assert!(matches!(st.ttl(b"k"), Ttl::Remaining(ms) if ms > 59_000));
    }

    #[test]
    fn ttl_states() {
        let mut st = store(100, EvictionPolicy::AllKeysRandom);
        assert_eq!(st.ttl(b"nope"), Ttl::Missing);
        st.set(Bytes::from("p"), s("v"), 0);
        assert_eq!(st.ttl(b"p"), Ttl::Persistent);
        assert!(!st.set_expiry(b"nope", 1000));
        assert!(st.expiry(b"nope").is_none());
    }

    #[test]
    fn delete_reports_presence() {
        let mut st = store(100, EvictionPolicy::AllKeysRandom);
        st.set(Bytes::from("k"), s("v"), 5000);
        assert!(st.delete(b"k"));
        assert!(!st.delete(b"k"));
        assert_eq!(st.stats().keys(), 0);
        assert_eq!(st.stats().expires(), 0);
    }

    #[test]
    fn random_eviction_never_exceeds_capacity() {
        let mut st = store(10, EvictionPolicy::AllKeysRandom);
        for i in 0..100 {
            st.set(Bytes::from(format!("k{i}")), s("v"), 0);
            assert!(st.len() <= 10);
        }
        // overwriting an existing key at capacity evicts nothing
        st.set(Bytes::from("k99"), s("w"), 0);
        assert_eq!(st.len(), 10);
        assert_eq!(st.stats().keys(), 10);
    }

    #[test]
    fn lru_eviction_drops_least_recently_used() {
        let mut st = store(3, EvictionPolicy::AllKeysLru);
        st.set(Bytes::from("a"), s("1"), 0);
        sleep(Duration::from_millis(3));
        st.set(Bytes::from("b"), s("2"), 0);
        sleep(Duration::from_millis(3));
        st.set(Bytes::from("c"), s("3"), 0);
        sleep(Duration::from_millis(3));
        // touch "a" so "b" becomes the oldest
        assert!(st.get(b"a").is_some());
        sleep(Duration::from_millis(3));

        st.set(Bytes::from("d"), s("4"), 0);
        assert_eq!(st.len(), 3);
        assert!(st.exists(b"a"));
        assert!(!st.exists(b"b"));
        assert!(st.exists(b"c"));
        assert!(st.exists(b"d"));
    }

    #[test]
    fn active_expiration_reclaims_unread_keys() {
        let mut st = store(1000, EvictionPolicy::AllKeysRandom);
        for i in 0..50 {
            st.set(Bytes::from(format!("tmp{i}")), s("gone"), 10);
        }
        for i in 0..5 {
            st.set(Bytes::from(format!("keep{i}")), s("stay"), 0);
        }
        st.set(Bytes::from("later"), s("stay"), 60_000);
        sleep(Duration::from_millis(30));

        let removed = st.active_expire_cycle();
        assert_eq!(removed, 50);
        assert_eq!(st.len(), 6);
        assert_eq!(st.stats().keys(), 6);
        assert_eq!(st.stats().expires(), 1);
    }

    #[test]
    fn active_expiration_on_empty_store() {
        let mut st = store(10, EvictionPolicy::AllKeysRandom);
        assert_eq!(st.active_expire_cycle(), 0);
    }
}
