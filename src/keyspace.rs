//! Key space primitives
//!
//! Keys are raw bytes ordered lexicographically. A [`KeyRange`] is an
//! interval over that order whose ends may be inclusive, exclusive or
//! unbounded.

use std::cmp::Ordering;
use serde::{Deserialize, Serialize};

/// Raw key bytes
pub type Key = Vec<u8>;

/// One end of a key range
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyBound {
    Included(Key),
    Excluded(Key),
    Unbounded,
}

/// Interval over the ordered key space
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: KeyBound,
    pub end: KeyBound,
}

impl KeyRange {
    /// The whole key space
    pub fn full() -> Self {
        Self {
            start: KeyBound::Unbounded,
            end: KeyBound::Unbounded,
        }
    }

    /// Half-open range `[start, end)`
    pub fn half_open(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            start: KeyBound::Included(start.into()),
            end: KeyBound::Excluded(end.into()),
        }
    }

    /// Closed range `[start, end]`
    pub fn closed(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            start: KeyBound::Included(start.into()),
            end: KeyBound::Included(end.into()),
        }
    }

    /// `[start, +inf)`
    pub fn from_key(start: impl Into<Key>) -> Self {
        Self {
            start: KeyBound::Included(start.into()),
            end: KeyBound::Unbounded,
        }
    }

    /// Check whether the key lies inside the range
    pub fn contains(&self, key: &[u8]) -> bool {
        let above_start = match &self.start {
            KeyBound::Included(s) => key >= s.as_slice(),
            KeyBound::Excluded(s) => key > s.as_slice(),
            KeyBound::Unbounded => true,
        };
        let below_end = match &self.end {
            KeyBound::Included(e) => key <= e.as_slice(),
            KeyBound::Excluded(e) => key < e.as_slice(),
            KeyBound::Unbounded => true,
        };
        above_start && below_end
    }

    /// Check whether `other` lies entirely inside this range
    pub fn covers(&self, other: &KeyRange) -> bool {
        if other.is_empty() {
            return true;
        }
        compare_starts(&self.start, &other.start) != Ordering::Greater
            && compare_ends(&self.end, &other.end) != Ordering::Less
    }

    /// The part of this range strictly above `key`
    pub fn after(&self, key: &[u8]) -> KeyRange {
        let start = KeyBound::Excluded(key.to_vec());
        let start = if compare_starts(&self.start, &start) == Ordering::Greater {
            self.start.clone()
        } else {
            start
        };
        KeyRange {
            start,
            end: self.end.clone(),
        }
    }

    /// True when no key can satisfy the range
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (KeyBound::Unbounded, _) | (_, KeyBound::Unbounded) => false,
            (KeyBound::Included(s), KeyBound::Included(e)) => s > e,
            (KeyBound::Included(s), KeyBound::Excluded(e))
            | (KeyBound::Excluded(s), KeyBound::Included(e)) => s >= e,
            (KeyBound::Excluded(s), KeyBound::Excluded(e)) => {
                // (s, e) is empty when e is s or s's immediate successor
                s >= e || is_immediate_successor(s, e)
            }
        }
    }

    /// Lowest key that could be inside the range, if bounded below
    pub fn start_key(&self) -> Option<&[u8]> {
        match &self.start {
            KeyBound::Included(k) | KeyBound::Excluded(k) => Some(k),
            KeyBound::Unbounded => None,
        }
    }
}

fn is_immediate_successor(s: &[u8], e: &[u8]) -> bool {
    e.len() == s.len() + 1 && e.starts_with(s) && e[s.len()] == 0
}

/// Order start bounds by how much of the key space they admit (smaller admits more)
fn compare_starts(a: &KeyBound, b: &KeyBound) -> Ordering {
    match (a, b) {
        (KeyBound::Unbounded, KeyBound::Unbounded) => Ordering::Equal,
        (KeyBound::Unbounded, _) => Ordering::Less,
        (_, KeyBound::Unbounded) => Ordering::Greater,
        (KeyBound::Included(x), KeyBound::Included(y))
        | (KeyBound::Excluded(x), KeyBound::Excluded(y)) => x.cmp(y),
        (KeyBound::Included(x), KeyBound::Excluded(y)) => {
            if x <= y { Ordering::Less } else { Ordering::Greater }
        }
        (KeyBound::Excluded(x), KeyBound::Included(y)) => {
            if x < y { Ordering::Less } else { Ordering::Greater }
        }
    }
}

/// Order end bounds by how far they reach (greater reaches further)
fn compare_ends(a: &KeyBound, b: &KeyBound) -> Ordering {
    match (a, b) {
        (KeyBound::Unbounded, KeyBound::Unbounded) => Ordering::Equal,
        (KeyBound::Unbounded, _) => Ordering::Greater,
        (_, KeyBound::Unbounded) => Ordering::Less,
        (KeyBound::Included(x), KeyBound::Included(y))
        | (KeyBound::Excluded(x), KeyBound::Excluded(y)) => x.cmp(y),
        (KeyBound::Included(x), KeyBound::Excluded(y)) => {
            if x >= y { Ordering::Greater } else { Ordering::Less }
        }
        (KeyBound::Excluded(x), KeyBound::Included(y)) => {
            if x > y { Ordering::Greater } else { Ordering::Less }
        }
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.start {
            KeyBound::Included(k) => write!(f, "[{}", hex(k))?,
            KeyBound::Excluded(k) => write!(f, "({}", hex(k))?,
            KeyBound::Unbounded => write!(f, "(-inf")?,
        }
        match &self.end {
            KeyBound::Included(k) => write!(f, ", {}]", hex(k)),
            KeyBound::Excluded(k) => write!(f, ", {})", hex(k)),
            KeyBound::Unbounded => write!(f, ", +inf)"),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
