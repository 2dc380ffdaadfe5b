//! Functional vindex whose keyspace id is `vhash` of the column value.

use async_trait::async_trait;

use crate::destination::Destination;
use crate::error::Result;
use crate::keyspace_id::{vhash, vunhash};
use crate::value::Value;
use crate::vindex::{check_verify_lengths, Reversible, SingleColumn, VCursor, Vindex};

pub const KIND: &str = "hash";

#[derive(Debug, Clone)]
pub struct Hash {
    name: String,
}

impl Hash {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Values that are not unsigned integers map to `None`.
    pub fn map_values(&self, ids: &[Value]) -> Vec<Destination> {
        ids.iter()
            .map(|id| match id.to_u64() {
                Ok(num) => Destination::hashed(num),
                Err(_) => Destination::None,
            })
            .collect()
    }

    pub fn verify_values(&self, ids: &[Value], ksids: &[Vec<u8>]) -> Result<Vec<bool>> {
        check_verify_lengths("hash.Verify", ids, ksids)?;
        ids.iter()
            .zip(ksids)
            .map(|(id, ksid)| {
                let num = id.to_u64().map_err(|err| err.context("hash.Verify"))?;
                Ok(vhash(num).as_slice() == ksid.as_slice())
            })
            .collect()
    }

    pub fn reverse_values(&self, ksids: &[Vec<u8>]) -> Result<Vec<u64>> {
        ksids.iter().map(|ksid| vunhash(ksid)).collect()
    }
}

impl Vindex for Hash {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    fn cost(&self) -> i32 {
        1
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
impl SingleColumn for Hash {
    async fn map(&self, _cursor: &dyn VCursor, ids: &[Value]) -> Result<Vec<Destination>> {
        Ok(self.map_values(ids))
    }

    async fn verify(
        &self,
        _cursor: &dyn VCursor,
        ids: &[Value],
        ksids: &[Vec<u8>],
    ) -> Result<Vec<bool>> {
        self.verify_values(ids, ksids)
    }
}

impl Reversible for Hash {
    fn reverse_map(&self, ksids: &[Vec<u8>]) -> Result<Vec<Value>> {
        Ok(self
            .reverse_values(ksids)?
            .into_iter()
            .map(Value::Uint64)
            .collect())
    }
}
