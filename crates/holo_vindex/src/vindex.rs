//! The vindex contract and the query-execution seam it depends on.
//!
//! The planner only ever sees `dyn Vindex` and asks for the capabilities it
//! needs (`as_single_column`, `as_reversible`, `as_lookup`). Table-backed
//! vindexes talk to the datastore exclusively through [`VCursor`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::CacheStats;
use crate::destination::Destination;
use crate::error::{Result, VindexError};
use crate::value::Value;

/// Transaction placement of a statement issued by a vindex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitOrder {
    /// Part of the caller's transaction.
    #[default]
    Normal,
    /// Committed before the caller's transaction.
    Pre,
    /// Committed after the caller's transaction.
    Post,
    /// Outside any transaction.
    Autocommit,
}

/// A named bind variable: a scalar or a tuple for `in ::name` lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindVar {
    Value(Value),
    Tuple(Vec<Value>),
}

/// A parameterized statement plus routing directives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoundQuery {
    pub sql: String,
    pub bind_vars: BTreeMap<String, BindVar>,
    /// Route to every shard instead of resolving a destination.
    ///
    /// Required whenever a vindex queries the table it is itself the vindex
    /// for; executors must honor it or the query recurses back into the
    /// vindex.
    pub force_scatter: bool,
}

impl BoundQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    pub fn bind(mut self, name: impl Into<String>, var: BindVar) -> Self {
        self.bind_vars.insert(name.into(), var);
        self
    }

    pub fn bind_value(self, name: impl Into<String>, value: Value) -> Self {
        self.bind(name, BindVar::Value(value))
    }

    pub fn force_scatter(mut self) -> Self {
        self.force_scatter = true;
        self
    }
}

/// Typed rows returned by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryResult {
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Vec<Value>>) -> Self {
        Self {
            rows_affected: rows.len() as u64,
            rows,
        }
    }
}

/// Query-execution collaborator handed to every vindex call.
#[async_trait]
pub trait VCursor: Send + Sync {
    async fn execute(
        &self,
        method: &str,
        query: BoundQuery,
        order: CommitOrder,
    ) -> anyhow::Result<QueryResult>;

    /// An owned handle usable after the current request returns.
    ///
    /// Cursors bound to a request session return `None`, which keeps
    /// verification reads on the request path.
    fn detach(&self) -> Option<Arc<dyn VCursor>> {
        None
    }
}

/// Cursor for contexts without a datastore; every statement fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStoreCursor;

#[async_trait]
impl VCursor for NoStoreCursor {
    async fn execute(
        &self,
        method: &str,
        _query: BoundQuery,
        _order: CommitOrder,
    ) -> anyhow::Result<QueryResult> {
        anyhow::bail!("{method}: no backing store available")
    }
}

/// Metadata shared by every vindex kind.
pub trait Vindex: Send + Sync {
    /// Configured name of this instance.
    fn name(&self) -> &str;
    /// Registry kind this instance was built from.
    fn kind(&self) -> &'static str;
    /// Planner preference; lower wins.
    fn cost(&self) -> i32;
    fn is_unique(&self) -> bool;
    /// `true` when no backing store is needed to resolve values.
    fn is_functional(&self) -> bool;
    /// `true` when Map/Verify issue statements through the cursor.
    fn needs_vcursor(&self) -> bool;

    fn as_single_column(&self) -> Option<&dyn SingleColumn> {
        None
    }

    fn as_reversible(&self) -> Option<&dyn Reversible> {
        None
    }

    fn as_lookup(&self) -> Option<&dyn Lookup> {
        None
    }

    fn cache_stats(&self) -> Option<CacheStats> {
        None
    }
}

/// Resolution of one column.
#[async_trait]
pub trait SingleColumn: Vindex {
    /// Maps ids to destinations, 1:1 and in input order.
    async fn map(&self, cursor: &dyn VCursor, ids: &[Value]) -> Result<Vec<Destination>>;

    /// Checks that each id maps to the keyspace id at the same position.
    async fn verify(
        &self,
        cursor: &dyn VCursor,
        ids: &[Value],
        ksids: &[Vec<u8>],
    ) -> Result<Vec<bool>>;
}

/// Vindexes that can recover a value from its keyspace id.
pub trait Reversible: SingleColumn {
    fn reverse_map(&self, ksids: &[Vec<u8>]) -> Result<Vec<Value>>;
}

/// Vindexes that must be told about owning-row mutations.
#[async_trait]
pub trait Lookup: SingleColumn {
    /// Records new rows. An error must abort the enclosing write.
    async fn create(
        &self,
        cursor: &dyn VCursor,
        rows: &[Vec<Value>],
        ksids: &[Vec<u8>],
        ignore_mode: bool,
    ) -> Result<()>;

    async fn update(
        &self,
        cursor: &dyn VCursor,
        old_values: &[Value],
        ksid: &[u8],
        new_values: &[Value],
    ) -> Result<()>;

    async fn delete(&self, cursor: &dyn VCursor, rows: &[Vec<Value>], ksid: &[u8]) -> Result<()>;
}

/// Rejects Verify calls whose id and keyspace id lists differ in length.
pub(crate) fn check_verify_lengths(context: &str, ids: &[Value], ksids: &[Vec<u8>]) -> Result<()> {
    if ids.len() != ksids.len() {
        return Err(VindexError::internal(
            context,
            format!("got {} ids and {} keyspace ids", ids.len(), ksids.len()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_query_builder() {
        let query = BoundQuery::new("select 1")
            .bind_value("a", Value::Int64(1))
            .bind("b", BindVar::Tuple(vec![Value::Int64(2)]))
            .force_scatter();
        assert!(query.force_scatter);
        assert_eq!(query.bind_vars.len(), 2);
        assert_eq!(query.bind_vars["a"], BindVar::Value(Value::Int64(1)));
    }

    #[tokio::test]
    async fn no_store_cursor_fails_every_statement() {
        let err = NoStoreCursor
            .execute("Probe", BoundQuery::new("select 1"), CommitOrder::Normal)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Probe: no backing store available");
        assert!(NoStoreCursor.detach().is_none());
    }
}
