//! Placement Service Port
//!
//! Maps keys and ranges to the replicas that own them. The real lookup
//! service is an external collaborator; [`StaticPlacement`] serves a fixed
//! partition table.

use std::collections::BTreeMap;
use std::ops::Bound;
use async_trait::async_trait;

use crate::error::Result;
use crate::keyspace::{Key, KeyRange};
use crate::membership::NodeId;

/// Key-to-owner lookup
#[async_trait]
pub trait Placement: Send + Sync {
    /// Preferred owner of `key`
    async fn owner_of(&self, key: &[u8]) -> Result<Option<NodeId>>;

    /// Owners of the partition holding the start of `range`
    async fn owners_of(&self, range: &KeyRange) -> Result<Vec<NodeId>>;
}

/// Fixed partition table: each entry owns keys from its start up to the next start
#[derive(Debug, Clone, Default)]
pub struct StaticPlacement {
    partitions: BTreeMap<Key, Vec<NodeId>>,
}

impl StaticPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the partition starting at `start`
    pub fn assign(mut self, start: impl Into<Key>, owners: Vec<NodeId>) -> Self {
        self.partitions.insert(start.into(), owners);
        self
    }

    fn lookup(&self, key: &[u8]) -> &[NodeId] {
        self.partitions
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, owners)| owners.as_slice())
            .unwrap_or(&[])
    }
}

#[async_trait]
impl Placement for StaticPlacement {
    async fn owner_of(&self, key: &[u8]) -> Result<Option<NodeId>> {
        Ok(self.lookup(key).first().cloned())
    }

    async fn owners_of(&self, range: &KeyRange) -> Result<Vec<NodeId>> {
        Ok(self.lookup(range.start_key().unwrap_or(&[])).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_lookup() {
        let a = NodeId::new("a", 1);
        let b = NodeId::new("b", 1);
        let placement = StaticPlacement::new()
            .assign(Vec::new(), vec![a.clone()])
            .assign(b"m".to_vec(), vec![b.clone(), a.clone()]);

        assert_eq!(placement.owner_of(b"c").await.unwrap(), Some(a.clone()));
        assert_eq!(placement.owner_of(b"m").await.unwrap(), Some(b.clone()));
        assert_eq!(placement.owner_of(b"zz").await.unwrap(), Some(b.clone()));
        assert_eq!(
            placement.owners_of(&KeyRange::from_key(b"n".to_vec())).await.unwrap(),
            vec![b, a.clone()]
        );
        assert_eq!(placement.owners_of(&KeyRange::full()).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_lookup_on_partition_boundaries() {
        let a = NodeId::new("a", 1);
        let b = NodeId::new("b", 1);
        let c = NodeId::new("c", 1);
        let placement = StaticPlacement::new()
            .assign(b"g".to_vec(), vec![a.clone()])
            .assign(b"p".to_vec(), vec![b.clone()])
            .assign(b"pa".to_vec(), vec![c.clone()]);

        // below the first partition start nothing owns the key
        assert_eq!(placement.owner_of(b"a").await.unwrap(), None);
        assert_eq!(placement.owner_of(b"g").await.unwrap(), Some(a.clone()));
        assert_eq!(placement.owner_of(b"o\xff").await.unwrap(), Some(a));
        assert_eq!(placement.owner_of(b"p").await.unwrap(), Some(b.clone()));
        assert_eq!(placement.owner_of(b"p\x00").await.unwrap(), Some(b));
        assert_eq!(placement.owner_of(b"pa").await.unwrap(), Some(c));
    }

    #[tokio::test]
    async fn test_empty_table() {
        let placement = StaticPlacement::new();
        assert_eq!(placement.owner_of(b"k").await.unwrap(), None);
    }
}
