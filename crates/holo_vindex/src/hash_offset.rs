//! Hash vindex over `value + offset`.
//!
//! Lets two id spaces that differ by a constant (local ids vs. global ids)
//! share one shard placement.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::destination::Destination;
use crate::error::{Result, VindexError};
use crate::hash::Hash;
use crate::value::Value;
use crate::vindex::{Reversible, SingleColumn, VCursor, Vindex};

pub const KIND: &str = "hash_offset";

const CONSTRUCTOR: &str = "hash_offset.NewHashOffset";

#[derive(Debug, Clone)]
pub struct HashOffset {
    hash: Hash,
    offset: u64,
}

impl HashOffset {
    /// Builds the vindex from its `offset` param, a signed 64-bit integer.
    pub fn new(name: &str, params: &BTreeMap<String, String>) -> Result<Self> {
        let raw = params
            .get("offset")
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| VindexError::config(CONSTRUCTOR, "'offset' param missing"))?;
        let offset = raw.parse::<i64>().map_err(|_| {
            VindexError::config(CONSTRUCTOR, format!("{raw:?} is not a valid offset"))
        })?;
        Ok(Self::with_offset(name, offset))
    }

    pub fn with_offset(name: &str, offset: i64) -> Self {
        Self {
            hash: Hash::new(name),
            offset: offset as u64,
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset as i64
    }
}

/// Adds `offset` (wrapping) to every unsigned-convertible value. Anything
/// else, null included, passes through for the hash to reject.
fn apply_offset(offset: u64, ids: &[Value]) -> Vec<Value> {
    ids.iter()
        .map(|id| match id.to_u64() {
            Ok(num) => Value::Uint64(num.wrapping_add(offset)),
            Err(_) => id.clone(),
        })
        .collect()
}

impl Vindex for HashOffset {
    fn name(&self) -> &str {
        self.hash.name()
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    fn cost(&self) -> i32 {
        self.hash.cost()
    }

    fn is_unique(&self) -> bool {
        true
    }

    fn is_functional(&self) -> bool {
        true
    }

    fn needs_vcursor(&self) -> bool {
        false
    }

    fn as_single_column(&self) -> Option<&dyn SingleColumn> {
        Some(self)
    }

    fn as_reversible(&self) -> Option<&dyn Reversible> {
        Some(self)
    }
}

#[async_trait]
impl SingleColumn for HashOffset {
    async fn map(&self, _cursor: &dyn VCursor, ids: &[Value]) -> Result<Vec<Destination>> {
        Ok(self.hash.map_values(&apply_offset(self.offset, ids)))
    }

    async fn verify(
        &self,
        _cursor: &dyn VCursor,
        ids: &[Value],
        ksids: &[Vec<u8>],
    ) -> Result<Vec<bool>> {
        self.hash
            .verify_values(&apply_offset(self.offset, ids), ksids)
    }
}

impl Reversible for HashOffset {
    fn reverse_map(&self, ksids: &[Vec<u8>]) -> Result<Vec<Value>> {
        Ok(self
            .hash
            .reverse_values(ksids)?
            .into_iter()
            .map(|num| Value::Uint64(num.wrapping_sub(self.offset)))
            .collect())
    }
}
