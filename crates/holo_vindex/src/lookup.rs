//! Unique lookup vindex backed by a `from -> to` side table.
//!
//! Every call goes to the store: one statement per id. The cached variant
//! in [`crate::cached_lookup`] layers an LRU and batching on top, and
//! [`crate::scatter_cache`] uses this resolver as its dark-read partner.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use async_trait::async_trait;

use crate::destination::Destination;
use crate::error::{Result, VindexError};
use crate::keyspace_id::vunhash;
use crate::value::Value;
use crate::vindex::{
    check_verify_lengths, BoundQuery, CommitOrder, Lookup, QueryResult, SingleColumn, VCursor,
    Vindex,
};

pub const KIND: &str = "lookup_hash_unique";

/// Side-table coordinates shared by the lookup-backed kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupParams {
    pub table: String,
    pub from: String,
    pub to: String,
    /// Map answers `AllShards` while the table is being backfilled.
    pub write_only: bool,
    /// Writes commit on their own; deletes are skipped.
    pub autocommit: bool,
    /// Table that owns the looked-up rows, when declared.
    pub owner: Option<String>,
}

impl LookupParams {
    pub fn parse(kind: &str, params: &BTreeMap<String, String>) -> Result<Self> {
        let required = |field: &str| -> Result<String> {
            params
                .get(field)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    VindexError::config(kind, format!("missing required field: {field}"))
                })
        };
        let table = required("table")?;
        let from = required("from")?;
        if from.contains(',') {
            return Err(VindexError::config(kind, "multi-col keys unsupported"));
        }
        let to = required("to")?;
        Ok(Self {
            table,
            from,
            to,
            write_only: bool_param(kind, params, "write_only")?,
            autocommit: bool_param(kind, params, "autocommit")?,
            owner: params
                .get("owner")
                .map(|owner| owner.trim().to_string())
                .filter(|owner| !owner.is_empty()),
        })
    }
}

fn bool_param(kind: &str, params: &BTreeMap<String, String>, field: &str) -> Result<bool> {
    match params.get(field).map(String::as_str) {
        None | Some("") | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(other) => Err(VindexError::config(
            kind,
            format!("{field} value must be 'true' or 'false': '{other}'"),
        )),
    }
}

#[derive(Debug, Clone)]
pub struct LookupHashUnique {
    name: String,
    params: LookupParams,
}

impl LookupHashUnique {
    pub fn new(name: &str, params: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self::from_params(name, LookupParams::parse(KIND, params)?))
    }

    pub fn from_params(name: &str, params: LookupParams) -> Self {
        Self {
            name: name.to_string(),
            params,
        }
    }

    pub fn params(&self) -> &LookupParams {
        &self.params
    }

    pub fn write_only(&self) -> bool {
        self.params.write_only
    }

    /// Issues one point lookup per id. Every statement runs before any
    /// result is interpreted.
    async fn lookup(&self, cursor: &dyn VCursor, ids: &[Value]) -> Result<Vec<QueryResult>> {
        let LookupParams {
            table, from, to, ..
        } = &self.params;
        let sql = format!("select {to} from {table} where {from} = :{from}");
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let query = BoundQuery::new(sql.clone()).bind_value(from.clone(), id.clone());
            let result = cursor
                .execute("VindexLookup", query, CommitOrder::Normal)
                .await
                .map_err(|err| VindexError::query("lookup.Map", err))?;
            results.push(result);
        }
        Ok(results)
    }

    fn commit_order(&self) -> CommitOrder {
        if self.params.autocommit {
            CommitOrder::Autocommit
        } else {
            CommitOrder::Normal
        }
    }

    fn insert_query(&self, rows: &[Vec<Value>], values: &[u64], ignore_mode: bool) -> BoundQuery {
        let LookupParams {
            table, from, to, ..
        } = &self.params;
        let verb = if ignore_mode && !self.params.autocommit {
            "insert ignore into"
        } else {
            "insert into"
        };
        let mut sql = format!("{verb} {table}({from}, {to}) values");
        let mut query = BoundQuery::default();
        for (idx, (row, value)) in rows.iter().zip(values).enumerate() {
            let from_var = format!("{from}{idx}");
            let to_var = format!("{to}{idx}");
            if idx > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "(:{from_var}, :{to_var})");
            query = query
                .bind_value(from_var, row[0].clone())
                .bind_value(to_var, Value::Uint64(*value));
        }
        if self.params.autocommit {
            let _ = write!(sql, " on duplicate key update {from}={from}, {to}={to}");
        }
        query.sql = sql;
        query
    }
}

/// Rejects rows that do not carry exactly one column.
pub(crate) fn single_column_rows(context: &str, rows: &[Vec<Value>]) -> Result<()> {
    if rows.iter().any(|row| row.len() != 1) {
        return Err(VindexError::internal(context, "multi-col keys unsupported"));
    }
    Ok(())
}

/// Rejects keyspace ids that [`vunhash`] cannot decode.
pub(crate) fn check_keyspace_ids(context: &str, ksids: &[Vec<u8>]) -> Result<()> {
    unhash_all(context, ksids).map(|_| ())
}

fn unhash_all(context: &str, ksids: &[Vec<u8>]) -> Result<Vec<u64>> {
    ksids
        .iter()
        .map(|ksid| vunhash(ksid).map_err(|err| err.context(context)))
        .collect()
}

impl Vindex for LookupHashUnique {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    fn cost(&self) -> i32 {
        10
    }

    fn is_unique(&self) -> bool {
        true
    }

    fn is_functional(&self) -> bool {
        false
    }

    fn needs_vcursor(&self) -> bool {
        true
    }

    fn as_single_column(&self) -> Option<&dyn SingleColumn> {
        Some(self)
    }

    fn as_lookup(&self) -> Option<&dyn Lookup> {
        Some(self)
    }
}

#[async_trait]
impl SingleColumn for LookupHashUnique {
    async fn map(&self, cursor: &dyn VCursor, ids: &[Value]) -> Result<Vec<Destination>> {
        if self.params.write_only {
            return Ok(Destination::all_shards(ids.len()));
        }
        let queried: Vec<Value> = ids.iter().filter(|id| !id.is_null()).cloned().collect();
        let mut results = self.lookup(cursor, &queried).await?.into_iter();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if id.is_null() {
                out.push(Destination::None);
                continue;
            }
            let Some(result) = results.next() else {
                return Err(VindexError::internal(
                    "LookupHashUnique.Map",
                    "missing lookup result",
                ));
            };
            match result.rows.as_slice() {
                [] => out.push(Destination::None),
                [row] => match row.first().map(Value::to_u64) {
                    Some(Ok(num)) => out.push(Destination::hashed(num)),
                    _ => out.push(Destination::None),
                },
                _ => {
                    return Err(VindexError::internal(
                        "LookupHashUnique.Map",
                        format!(
                            "unexpected multiple results from vindex {}: {id}",
                            self.params.table
                        ),
                    ))
                }
            }
        }
        Ok(out)
    }

    async fn verify(
        &self,
        cursor: &dyn VCursor,
        ids: &[Value],
        ksids: &[Vec<u8>],
    ) -> Result<Vec<bool>> {
        check_verify_lengths("lookup.Verify", ids, ksids)?;
        let values = unhash_all("lookup.Verify.vunhash", ksids)?;
        let LookupParams {
            table, from, to, ..
        } = &self.params;
        let sql = format!("select {from} from {table} where {from} = :{from} and {to} = :{to}");
        let mut out = Vec::with_capacity(ids.len());
        for (id, value) in ids.iter().zip(values) {
            let query = BoundQuery::new(sql.clone())
                .bind_value(from.clone(), id.clone())
                .bind_value(to.clone(), Value::Uint64(value));
            let result = cursor
                .execute("VindexVerify", query, CommitOrder::Normal)
                .await
                .map_err(|err| VindexError::query("lookup.Verify", err))?;
            out.push(!result.rows.is_empty());
        }
        Ok(out)
    }
}

#[async_trait]
impl Lookup for LookupHashUnique {
    async fn create(
        &self,
        cursor: &dyn VCursor,
        rows: &[Vec<Value>],
        ksids: &[Vec<u8>],
        ignore_mode: bool,
    ) -> Result<()> {
        single_column_rows("LookupHashUnique.Create", rows)?;
        if rows.len() != ksids.len() {
            return Err(VindexError::internal(
                "LookupHashUnique.Create",
                format!("got {} rows and {} keyspace ids", rows.len(), ksids.len()),
            ));
        }
        if rows.is_empty() {
            return Ok(());
        }
        let values = unhash_all("lookup.Create.vunhash", ksids)?;
        let query = self.insert_query(rows, &values, ignore_mode);
        cursor
            .execute("VindexCreate", query, self.commit_order())
            .await
            .map_err(|err| VindexError::query("lookup.Create", err))?;
        Ok(())
    }

    async fn update(
        &self,
        cursor: &dyn VCursor,
        old_values: &[Value],
        ksid: &[u8],
        new_values: &[Value],
    ) -> Result<()> {
        self.delete(cursor, &[old_values.to_vec()], ksid).await?;
        self.create(cursor, &[new_values.to_vec()], &[ksid.to_vec()], false)
            .await
    }

    async fn delete(&self, cursor: &dyn VCursor, rows: &[Vec<Value>], ksid: &[u8]) -> Result<()> {
        if self.params.autocommit {
            return Ok(());
        }
        single_column_rows("LookupHashUnique.Delete", rows)?;
        let value = vunhash(ksid).map_err(|err| err.context("lookup.Delete.vunhash"))?;
        let LookupParams {
            table, from, to, ..
        } = &self.params;
        let sql = format!("delete from {table} where {from} = :{from} and {to} = :{to}");
        for row in rows {
            let query = BoundQuery::new(sql.clone())
                .bind_value(from.clone(), row[0].clone())
                .bind_value(to.clone(), Value::Uint64(value));
            cursor
                .execute("VindexDelete", query, CommitOrder::Normal)
                .await
                .map_err(|err| VindexError::query("lookup.Delete", err))?;
        }
        Ok(())
    }
}
