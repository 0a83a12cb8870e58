//! # Duplicate Detection
//!
//! Bounded recency cache answering "have I seen this event id before".
//!
//! Every [`Connection`](crate::connection) owns one instance. Inbound events
//! are recorded before they reach the local bus, and outbound relays consult
//! the same instance so an event is never echoed back over the link it
//! arrived on.
//!
//! ## Eviction
//!
//! Eviction is strictly by insertion order. Membership checks use
//! [`LruCache::contains`], which does not refresh recency, so the cache
//! behaves as a fixed ring of the last `capacity` distinct ids rather than
//! an LRU-on-read structure.

use std::num::NonZeroUsize;

use lru::LruCache;

/// Default number of ids remembered per connection.
pub const DEFAULT_SEEN_CAPACITY: usize = 100;

pub struct Seen {
    ids: LruCache<String, ()>,
}

impl Seen {
    /// Create a detector remembering at most `capacity` ids.
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ids: LruCache::new(capacity),
        }
    }

    /// Record an id, evicting the oldest recorded id when full.
    pub fn add(&mut self, id: &str) {
        self.ids.put(id.to_owned(), ());
    }

    pub fn has(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn size(&self) -> usize {
        self.ids.len()
    }

    pub fn capacity(&self) -> usize {
        self.ids.cap().get()
    }
}

impl Default for Seen {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}

impl std::fmt::Debug for Seen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seen")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    #[test]
    fn remembers_added_id() {
        let mut seen = Seen::new(10);
        let id = fresh_id();
        assert!(!seen.has(&id));
        seen.add(&id);
        assert!(seen.has(&id));
        assert_eq!(seen.size(), 1);
    }

    #[test]
    fn initial_id_evicted_after_capacity_more() {
        let mut seen = Seen::new(10);
        let initial = fresh_id();
        seen.add(&initial);

        for _ in 0..10 {
            seen.add(&fresh_id());
        }

        assert!(!seen.has(&initial), "oldest id must be evicted");
        assert_eq!(seen.size(), 10);
    }

    #[test]
    fn only_most_recent_capacity_ids_survive() {
        let capacity = 16;
        let extra = 7;
        let mut seen = Seen::new(capacity);
        let ids: Vec<String> = (0..capacity + extra).map(|_| fresh_id()).collect();

        for id in &ids {
            seen.add(id);
            assert!(seen.size() <= capacity);
        }

        for (i, id) in ids.iter().enumerate() {
            assert_eq!(seen.has(id), i >= extra, "id #{i} membership mismatch");
        }
    }

    #[test]
    fn membership_check_does_not_refresh_recency() {
        let mut seen = Seen::new(3);
        seen.add("a");
        seen.add("b");
        seen.add("c");

        // Reading "a" must not save it from eviction.
        assert!(seen.has("a"));
        seen.add("d");

        assert!(!seen.has("a"));
        assert!(seen.has("b"));
        assert!(seen.has("c"));
        assert!(seen.has("d"));
    }

    #[test]
    fn zero_capacity_clamped() {
        let mut seen = Seen::new(0);
        assert_eq!(seen.capacity(), 1);
        seen.add("x");
        seen.add("y");
        assert!(!seen.has("x"));
        assert!(seen.has("y"));
    }

    #[test]
    fn default_capacity() {
        assert_eq!(Seen::default().capacity(), DEFAULT_SEEN_CAPACITY);
    }
}
