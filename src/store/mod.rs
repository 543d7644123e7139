//! Key-Value Store Port
//!
//! The physical byte store is an external collaborator. Replication and
//! data transfer reach it only through the [`KvStore`] trait defined here;
//! [`MemStore`] is the in-memory implementation used for single-node runs
//! and tests.

mod memory;

pub use memory::MemStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keyspace::{Key, KeyRange};

/// A stored entry; `value == None` is a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreItem {
    pub key: Key,
    pub value: Option<Vec<u8>>,
}

impl StoreItem {
    pub fn live(key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Bytes counted against scan and transfer quotas
    pub fn size(&self) -> usize {
        self.key.len() + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Bounds on a single scan page
///
/// A page always carries at least one item when any remain, even if that
/// item alone exceeds `max_bytes`, so pagination always makes progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanLimit {
    pub max_items: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl ScanLimit {
    pub fn bytes(max_bytes: usize) -> Self {
        Self {
            max_items: None,
            max_bytes: Some(max_bytes),
        }
    }

    pub fn items(max_items: usize) -> Self {
        Self {
            max_items: Some(max_items),
            max_bytes: None,
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// Which entries a scan returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadFilter {
    /// Live entries and tombstones
    All,
    /// Live entries only
    SkipTombstones,
}

/// One page of a range scan, in ascending key order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub items: Vec<StoreItem>,
    /// Sum of item sizes in this page
    pub bytes: usize,
    /// True when the limit stopped the scan before the range was exhausted
    pub more: bool,
}

impl ScanPage {
    pub fn last_key(&self) -> Option<&[u8]> {
        self.items.last().map(|i| i.key.as_slice())
    }
}

/// Change in store size caused by a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDelta {
    pub bytes: i64,
    pub keys: i64,
}

impl StoreDelta {
    pub fn merge(&mut self, other: StoreDelta) {
        self.bytes += other.bytes;
        self.keys += other.keys;
    }
}

/// Store size snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub keys: u64,
    pub bytes: u64,
}

/// Byte-keyed store consumed by replication and data transfer
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a live value
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write a value
    async fn put(&self, key: Key, value: Vec<u8>) -> Result<StoreDelta>;

    /// Delete a key, leaving a tombstone
    async fn delete(&self, key: &[u8]) -> Result<StoreDelta>;

    /// Read one page of `range`
    async fn scan(&self, range: &KeyRange, limit: ScanLimit, filter: ReadFilter) -> Result<ScanPage>;

    /// Current size
    async fn stats(&self) -> Result<StoreStats>;
}
