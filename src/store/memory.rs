//! In-memory store

use std::collections::BTreeMap;
use std::ops::Bound;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KvStore, ReadFilter, ScanLimit, ScanPage, StoreDelta, StoreItem, StoreStats};
use crate::error::Result;
use crate::keyspace::{Key, KeyBound, KeyRange};

/// `BTreeMap`-backed store with tombstones
#[derive(Debug, Default)]
pub struct MemStore {
    entries: RwLock<BTreeMap<Key, Option<Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding the given live entries
    pub fn with_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Key, Vec<u8>)>,
    {
        let map = entries.into_iter().map(|(k, v)| (k, Some(v))).collect();
        Self {
            entries: RwLock::new(map),
        }
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        self.entries.read().await.values().filter(|v| v.is_some()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn to_std(bound: &KeyBound) -> Bound<&[u8]> {
    match bound {
        KeyBound::Included(k) => Bound::Included(k.as_slice()),
        KeyBound::Excluded(k) => Bound::Excluded(k.as_slice()),
        KeyBound::Unbounded => Bound::Unbounded,
    }
}

fn live_size(key: &[u8], value: &Option<Vec<u8>>) -> i64 {
    match value {
        Some(v) => (key.len() + v.len()) as i64,
        None => 0,
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned().flatten())
    }

    async fn put(&self, key: Key, value: Vec<u8>) -> Result<StoreDelta> {
        let mut entries = self.entries.write().await;
        let new_size = (key.len() + value.len()) as i64;
        let delta = match entries.insert(key.clone(), Some(value)) {
            Some(Some(old)) => StoreDelta {
                bytes: new_size - live_size(&key, &Some(old)),
                keys: 0,
            },
            _ => StoreDelta {
                bytes: new_size,
                keys: 1,
            },
        };
        Ok(delta)
    }

    async fn delete(&self, key: &[u8]) -> Result<StoreDelta> {
        let mut entries = self.entries.write().await;
        let delta = match entries.insert(key.to_vec(), None) {
            Some(old @ Some(_)) => StoreDelta {
                bytes: -live_size(key, &old),
                keys: -1,
            },
            _ => StoreDelta::default(),
        };
        Ok(delta)
    }

    async fn scan(&self, range: &KeyRange, limit: ScanLimit, filter: ReadFilter) -> Result<ScanPage> {
        let mut page = ScanPage::default();
        if range.is_empty() {
            return Ok(page);
        }

        let entries = self.entries.read().await;
        let bounds = (to_std(&range.start), to_std(&range.end));

        for (key, value) in entries.range::<[u8], _>(bounds) {
            if value.is_none() && filter == ReadFilter::SkipTombstones {
                continue;
            }

            let item = StoreItem {
                key: key.clone(),
                value: value.clone(),
            };
            let size = item.size();

            let items_full = limit.max_items.map(|m| page.items.len() >= m).unwrap_or(false);
            let bytes_full = limit
                .max_bytes
                .map(|m| !page.items.is_empty() && page.bytes + size > m)
                .unwrap_or(false);
            if items_full || bytes_full {
                page.more = true;
                break;
            }

            page.bytes += size;
            page.items.push(item);
        }

        Ok(page)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let entries = self.entries.read().await;
        let mut stats = StoreStats::default();
        for (key, value) in entries.iter() {
            if let Some(v) = value {
                stats.keys += 1;
                stats.bytes += (key.len() + v.len()) as u64;
            }
        }
        Ok(stats)
    }
}
