//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use holo_vindex::{
    BindVar, BoundQuery, CommitOrder, QueryResult, StaticDecider, VCursor, Value, VindexEnv,
    VindexSettings,
};

/// One statement seen by a [`FakeCursor`].
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub method: String,
    pub query: BoundQuery,
    pub order: CommitOrder,
}

struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Default)]
struct Inner {
    queries: Mutex<Vec<RecordedQuery>>,
    tables: Mutex<HashMap<String, Table>>,
    fixed_rows: Mutex<Option<Vec<Vec<Value>>>>,
    failure: Mutex<Option<String>>,
    slow_tables: Mutex<HashMap<String, Duration>>,
}

/// Recording cursor over tiny in-memory tables.
///
/// Selects of the shapes vindexes issue (`select <cols> from <table> where
/// <col> = :<col> [and ...]` or `where <col> in ::<col>`) are answered from
/// the registered tables; bind variable names double as column names.
/// Every other statement succeeds without effect.
#[derive(Clone, Default)]
pub struct FakeCursor {
    inner: Arc<Inner>,
    detachable: bool,
}

impl FakeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cursor whose `detach` hands out a clone sharing the same state.
    pub fn detachable() -> Self {
        Self {
            inner: Arc::default(),
            detachable: true,
        }
    }

    pub fn with_table(self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        self.inner.tables.lock().unwrap().insert(
            table.to_string(),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        );
        self
    }

    /// Answers every select with `rows`, whatever it asks for.
    pub fn respond_with(&self, rows: Vec<Vec<Value>>) {
        *self.inner.fixed_rows.lock().unwrap() = Some(rows);
    }

    pub fn fail_with(&self, message: &str) {
        *self.inner.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn recover(&self) {
        *self.inner.failure.lock().unwrap() = None;
    }

    /// Delays every select against `table`.
    pub fn slow_table(&self, table: &str, delay: Duration) {
        self.inner
            .slow_tables
            .lock()
            .unwrap()
            .insert(table.to_string(), delay);
    }

    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.inner.queries.lock().unwrap().clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.queries().into_iter().map(|q| q.query.sql).collect()
    }

    pub fn query_count(&self) -> usize {
        self.inner.queries.lock().unwrap().len()
    }

    pub fn clear_queries(&self) {
        self.inner.queries.lock().unwrap().clear();
    }

    fn select(&self, query: &BoundQuery) -> Vec<Vec<Value>> {
        if let Some(rows) = self.inner.fixed_rows.lock().unwrap().clone() {
            return rows;
        }
        let Some((projection, table)) = parse_select(&query.sql) else {
            return Vec::new();
        };
        let tables = self.inner.tables.lock().unwrap();
        let Some(table) = tables.get(&table) else {
            return Vec::new();
        };
        let column = |name: &str| table.columns.iter().position(|c| c == name);
        table
            .rows
            .iter()
            .filter(|row| {
                query.bind_vars.iter().all(|(name, var)| {
                    let Some(idx) = column(name) else {
                        return true;
                    };
                    let cell = row[idx].cache_key();
                    match var {
                        BindVar::Value(value) => cell == value.cache_key(),
                        BindVar::Tuple(values) => values.iter().any(|v| v.cache_key() == cell),
                    }
                })
            })
            .map(|row| {
                projection
                    .iter()
                    .filter_map(|name| column(name).map(|idx| row[idx].clone()))
                    .collect()
            })
            .collect()
    }
}

fn parse_select(sql: &str) -> Option<(Vec<String>, String)> {
    let rest = sql.strip_prefix("select ")?;
    let (projection, rest) = rest.split_once(" from ")?;
    let table = rest.split_whitespace().next()?.to_string();
    let projection = projection
        .split(',')
        .map(|col| col.trim().to_string())
        .collect();
    Some((projection, table))
}

#[async_trait]
impl VCursor for FakeCursor {
    async fn execute(
        &self,
        method: &str,
        query: BoundQuery,
        order: CommitOrder,
    ) -> anyhow::Result<QueryResult> {
        self.inner.queries.lock().unwrap().push(RecordedQuery {
            method: method.to_string(),
            query: query.clone(),
            order,
        });
        if let Some(message) = self.inner.failure.lock().unwrap().clone() {
            anyhow::bail!(message);
        }
        if !query.sql.starts_with("select") {
            return Ok(QueryResult {
                rows: Vec::new(),
                rows_affected: 1,
            });
        }
        let delay = parse_select(&query.sql)
            .and_then(|(_, table)| self.inner.slow_tables.lock().unwrap().get(&table).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(QueryResult::from_rows(self.select(&query)))
    }

    fn detach(&self) -> Option<Arc<dyn VCursor>> {
        if self.detachable {
            Some(Arc::new(self.clone()))
        } else {
            None
        }
    }
}

pub fn int_rows(pairs: &[(i64, i64)]) -> Vec<Vec<Value>> {
    pairs
        .iter()
        .map(|(from, to)| vec![Value::Int64(*from), Value::Int64(*to)])
        .collect()
}

pub fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().copied().map(Value::Int64).collect()
}

pub fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Environment with an in-memory decider and fresh metrics.
pub fn env_with(decider: StaticDecider, settings: VindexSettings) -> VindexEnv {
    VindexEnv::new(settings, Arc::new(decider))
}

pub fn test_env() -> VindexEnv {
    env_with(StaticDecider::new(), VindexSettings::default())
}
