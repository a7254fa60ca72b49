//! Time-indexed cache backing the at-most-once delivery machinery.
//!
//! One generic store covers all four users: ICBM cookies, request ids,
//! direct-connection sequence numbers, and direct-client handles. Items keep
//! insertion order, expire at individually settable deadlines, and are moved
//! out (not dropped) on expiry so the caller can finalize them — typically
//! as an "undelivered" acknowledgement.
//!
//! Deadlines use [`tokio::time::Instant`], so tests drive expiry with the
//! paused clock.

use std::time::Duration;

use tokio::time::Instant;

struct Entry<K, V> {
    key: K,
    value: V,
    expires: Instant,
}

/// Insertion-ordered cache with per-item expiry.
pub struct TimedCache<K, V> {
    items: Vec<Entry<K, V>>,
    default_timeout: Duration,
}

impl<K: PartialEq + Copy, V> TimedCache<K, V> {
    /// Cache whose items default to expiring after `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            items: Vec::new(),
            default_timeout,
        }
    }

    /// Number of live items (expired-but-not-collected included).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The default timeout.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Insert with the default timeout. An existing entry under the same key
    /// is replaced (and returned).
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.insert_with_timeout(key, value, self.default_timeout)
    }

    /// Insert with an explicit timeout.
    pub fn insert_with_timeout(&mut self, key: K, value: V, timeout: Duration) -> Option<V> {
        let old = self.remove(&key);
        self.items.push(Entry {
            key,
            value,
            expires: Instant::now() + timeout,
        });
        old
    }

    /// True if the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.items.iter().any(|e| e.key == *key)
    }

    /// Borrow the value under a key.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.items.iter().find(|e| e.key == *key).map(|e| &e.value)
    }

    /// Mutably borrow the value under a key.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.items
            .iter_mut()
            .find(|e| e.key == *key)
            .map(|e| &mut e.value)
    }

    /// Remove and return the value under a key.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.items.iter().position(|e| e.key == *key)?;
        Some(self.items.remove(idx).value)
    }

    /// Re-arm the deadline of an existing entry.
    pub fn set_timeout(&mut self, key: &K, timeout: Duration) {
        if let Some(e) = self.items.iter_mut().find(|e| e.key == *key) {
            e.expires = Instant::now() + timeout;
        }
    }

    /// Move out every entry whose deadline has passed.
    pub fn drain_expired(&mut self) -> Vec<(K, V)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.items.len() {
            if self.items[i].expires <= now {
                let e = self.items.remove(i);
                expired.push((e.key, e.value));
            } else {
                i += 1;
            }
        }
        expired
    }

    /// Move out every entry, oldest first.
    pub fn drain_all(&mut self) -> Vec<(K, V)> {
        self.items.drain(..).map(|e| (e.key, e.value)).collect()
    }

    /// Move out every entry matching the predicate.
    pub fn drain_where(&mut self, mut pred: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.items.len() {
            if pred(&self.items[i].key, &self.items[i].value) {
                let e = self.items.remove(i);
                out.push((e.key, e.value));
            } else {
                i += 1;
            }
        }
        out
    }

    /// Iterate key/value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.items.iter().map(|e| (&e.key, &e.value))
    }

    /// Iterate key/value pairs mutably, in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.items.iter_mut().map(|e| (&e.key, &mut e.value))
    }

    /// Iterate keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.items.iter().map(|e| &e.key)
    }
}
