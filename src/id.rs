//! Node-scoped ID Generator
//!
//! Generates 64-bit identifiers that are unique across the cluster without
//! coordination. Every component that needs ids (operations, liveness
//! subscriptions, transfer sessions) receives the generator through its
//! constructor.
//!
//! ID Structure (64 bits):
//! - 16 bits: node identity hash
//! - 48 bits: monotonic counter
//!
//! The counter starts at the wall clock (milliseconds since 2024-01-01,
//! shifted by [`SEED_SHIFT`] bits), so a restarted node resumes above the
//! ids its previous incarnation handed out as long as it averaged fewer
//! than 256 ids per millisecond.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::membership::NodeId;

/// Custom epoch: 2024-01-01 00:00:00 UTC
const WOLFRING_EPOCH: u64 = 1704067200000;

/// Counter slots per millisecond of the seed
pub const SEED_SHIFT: u64 = 8;

/// Bit allocation
const COUNTER_BITS: u64 = 48;
const NODE_HASH_BITS: u64 = 16;

/// Masks
const MAX_COUNTER: u64 = (1 << COUNTER_BITS) - 1;
const MAX_NODE_HASH: u64 = (1 << NODE_HASH_BITS) - 1;

/// Id generator for a specific node
///
/// Thread-safe; share it behind an `Arc` between the tasks of one node.
#[derive(Debug)]
pub struct IdGenerator {
    node_hash: u64,
    counter: AtomicU64,
}

impl IdGenerator {
    /// Create a generator for the given node, seeded from the clock
    pub fn new(node: &NodeId) -> Self {
        Self::with_seed(Self::node_hash(node), Self::clock_seed())
    }

    /// Create a generator with an explicit 16-bit node hash, counting from zero
    pub fn with_hash(node_hash: u16) -> Self {
        Self::with_seed(node_hash, 0)
    }

    /// Create a generator whose first id follows `seed`
    pub fn with_seed(node_hash: u16, seed: u64) -> Self {
        Self {
            node_hash: node_hash as u64,
            counter: AtomicU64::new(seed & MAX_COUNTER),
        }
    }

    /// Milliseconds since the custom epoch, scaled into the counter space
    pub fn clock_seed() -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(WOLFRING_EPOCH);
        (now.saturating_sub(WOLFRING_EPOCH) << SEED_SHIFT) & MAX_COUNTER
    }

    /// Generate the next id
    pub fn next(&self) -> u64 {
        let count = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        (self.node_hash << COUNTER_BITS) | (count & MAX_COUNTER)
    }

    /// Extract the node hash part of an id
    pub fn node_hash_of(id: u64) -> u16 {
        ((id >> COUNTER_BITS) & MAX_NODE_HASH) as u16
    }

    /// Fold the crc32 of the node's textual identity into 16 bits
    pub fn node_hash(node: &NodeId) -> u16 {
        let crc = crc32fast::hash(node.to_string().as_bytes());
        ((crc >> 16) ^ (crc & 0xFFFF)) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_generate_unique_ids() {
        let gen = IdGenerator::with_hash(1);
        let mut ids = HashSet::new();

        for _ in 0..10000 {
            let id = gen.next();
            assert!(ids.insert(id), "Duplicate ID generated: {}", id);
        }
    }

    #[test]
    fn test_ids_are_ordered() {
        let gen = IdGenerator::with_hash(9);
        let mut last_id = 0u64;

        for _ in 0..1000 {
            let id = gen.next();
            assert!(id > last_id, "IDs should be monotonically increasing");
            last_id = id;
        }
    }

    #[test]
    fn test_concurrent_generation() {
        let gen = Arc::new(IdGenerator::with_hash(3));
        let mut handles = vec![];

        for _ in 0..4 {
            let gen = Arc::clone(&gen);
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| gen.next()).collect::<Vec<_>>()
            }));
        }

        let mut all_ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all_ids.insert(id), "Duplicate ID in concurrent test");
            }
        }

        assert_eq!(all_ids.len(), 4000);
    }

    #[test]
    fn test_restarted_node_resumes_above_previous_ids() {
        let node = NodeId::new("10.0.0.1", 7654);
        let before = IdGenerator::new(&node);
        let last = (0..100).map(|_| before.next()).max().unwrap();

        thread::sleep(std::time::Duration::from_millis(2));
        let after = IdGenerator::new(&node);
        assert!(after.next() > last);
    }

    #[test]
    fn test_seed_sets_the_first_id() {
        let gen = IdGenerator::with_seed(2, 41);
        let id = gen.next();
        assert_eq!(IdGenerator::node_hash_of(id), 2);
        assert_eq!(id & MAX_COUNTER, 42);
        assert!(IdGenerator::clock_seed() > 0);
    }

    #[test]
    fn test_node_hash_is_embedded() {
        let a = NodeId::new("10.0.0.1", 7654);
        let b = NodeId::new("10.0.0.2", 7654);
        let gen_a = IdGenerator::new(&a);
        let gen_b = IdGenerator::new(&b);

        assert_eq!(IdGenerator::node_hash_of(gen_a.next()), IdGenerator::node_hash(&a));
        assert_ne!(gen_a.next(), gen_b.next());
    }
}
