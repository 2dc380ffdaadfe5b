//! Shard destinations produced by vindex resolution.

use std::fmt;

use crate::keyspace_id::vhash;

/// Where a resolved value lives.
///
/// `None` ("not found") and `AllShards` (full keyspace range, forces a
/// scatter) are explicit sentinels, distinct from resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A single keyspace id.
    KeyspaceId(Vec<u8>),
    /// The value does not map to any shard (yet).
    None,
    /// The full keyspace range.
    AllShards,
}

impl Destination {
    /// Destination of a value whose keyspace id is `vhash(value)`.
    pub fn hashed(value: u64) -> Self {
        Self::KeyspaceId(vhash(value).to_vec())
    }

    pub fn keyspace_id(&self) -> Option<&[u8]> {
        match self {
            Self::KeyspaceId(ksid) => Some(ksid),
            _ => None,
        }
    }

    /// `AllShards` for every one of `count` ids.
    pub fn all_shards(count: usize) -> Vec<Self> {
        vec![Self::AllShards; count]
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyspaceId(ksid) => write!(f, "ksid:{}", hex::encode(ksid)),
            Self::None => f.write_str("none"),
            Self::AllShards => f.write_str("all"),
        }
    }
}
