/*!
 * Eviction Candidate Pool
 *
 * Approximated LRU: instead of keeping every key in access order, an eviction
 * pass samples a handful of keys, keeps them sorted by last access time and
 * evicts from the oldest end. The pool is rebuilt for every pass.
 */

use bytes::Bytes;

/// One sampled key and the access time it had when sampled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: Bytes,
    /// Monotonic milliseconds, see [`crate::clock::now_ms`]
    pub last_access: u64,
}

/// Bounded list of sampled keys, ordered oldest first
#[derive(Debug)]
pub struct EvictionPool {
    pool: Vec<Candidate>,
    capacity: usize,
}

impl EvictionPool {
    /// Create an empty pool
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of candidates kept; zero makes every push a no-op
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a sample, keeping the pool sorted by access time
    ///
    /// When full, the sample replaces the most recently used candidate if it
    /// is older than it; otherwise it is dropped.
    ///
    /// # Arguments
    /// * `key` - Sampled key
    /// * `last_access` - Its last access time
    pub fn push(&mut self, key: Bytes, last_access: u64) {
        if self.capacity == 0 {
            return;
        }
        if self.pool.len() == self.capacity {
            match self.pool.last() {
                Some(newest) if newest.last_access > last_access => {
                    self.pool.pop();
                }
                _ => return,
            }
        }
        let at = self.pool.partition_point(|c| c.last_access <= last_access);
        self.pool.insert(at, Candidate { key, last_access });
    }

    /// Take the least recently used candidate
    ///
    /// # Returns
    /// * `Some(Candidate)` with the oldest access time
    /// * `None` once the pool is exhausted
    pub fn pop(&mut self) -> Option<Candidate> {
        if self.pool.is_empty() {
            None
        } else {
            Some(self.pool.remove(0))
        }
    }

    /// Number of candidates currently held
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}
