//! Unique vindex resolved by scatter queries against the owning table.
//!
//! Answers are cached per instance. The owning table is the table this
//! vindex routes, so every lookup query is issued with the force-scatter
//! directive. A capacity of zero turns the vindex into "always scatter":
//! Map returns `AllShards` and touches neither the store nor the cache.
//!
//! Dark reads re-resolve a sample of calls through a [`LookupHashUnique`]
//! partner and count agreement in [`VindexMetrics::dark_reads`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::breaker::{Verdict, VerificationBreaker};
use crate::cache::{CacheStats, KeyspaceIdCache};
use crate::config::VindexEnv;
use crate::destination::Destination;
use crate::error::{Result, VindexError};
use crate::keyspace_id::vhash;
use crate::lookup::{check_keyspace_ids, single_column_rows, LookupHashUnique, LookupParams};
use crate::metrics::{failure, outcome, VindexMetrics};
use crate::value::Value;
use crate::vindex::{
    check_verify_lengths, BindVar, BoundQuery, CommitOrder, Lookup, SingleColumn, VCursor, Vindex,
};

pub const KIND: &str = "scatter_cache";

const MAP_CONTEXT: &str = "ScatterCache.Map";

fn is_allowed_identifier_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '@'
}

fn identifier_param(params: &BTreeMap<String, String>, field: &str) -> Result<Option<String>> {
    match params.get(field).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(value) if !value.chars().all(is_allowed_identifier_char) => Err(VindexError::config(
            KIND,
            format!("{field} contains illegal characters: {value}"),
        )),
        Some(value) => Ok(Some(value.to_string())),
    }
}

fn required_identifier(params: &BTreeMap<String, String>, field: &str) -> Result<String> {
    identifier_param(params, field)?
        .ok_or_else(|| VindexError::config(KIND, format!("missing required field: {field}")))
}

/// Dark-read partner and sampling policy.
struct DarkRead {
    lookup: Arc<LookupHashUnique>,
    /// Percent of Map calls that are re-resolved.
    probability: u32,
    /// Re-resolve on the request path even when a detached cursor exists.
    sync: bool,
}

pub struct ScatterCache {
    name: String,
    /// Owning table, queried with force scatter.
    table: String,
    /// Column holding the vindexed value.
    from: String,
    /// Column holding the value whose hash is the keyspace id.
    to: String,
    /// Configured bound; zero always scatters.
    capacity: u64,
    cache: KeyspaceIdCache,
    /// Maximum ids per lookup query.
    batch_size: usize,
    /// Lookup partner for dark reads, when configured.
    dark_read: Option<DarkRead>,
    /// Upper bound on one dark read.
    verification_timeout: Duration,
    /// Shared with spawned dark reads.
    breaker: Arc<VerificationBreaker>,
    metrics: Arc<VindexMetrics>,
}

impl ScatterCache {
    /// Builds the vindex from `table`, `from`, `to` and `capacity`, plus the
    /// optional dark-read params `dark_read_table`,
    /// `dark_read_probability` (0 to 100) and `sync_dark_read`.
    pub fn new(name: &str, params: &BTreeMap<String, String>, env: &VindexEnv) -> Result<Self> {
        let from = required_identifier(params, "from")?;
        let to = required_identifier(params, "to")?;
        let table = required_identifier(params, "table")?;
        let raw_capacity = required_identifier(params, "capacity")?;
        let capacity = raw_capacity.parse::<u64>().map_err(|_| {
            VindexError::config(KIND, format!("capacity is not a valid integer: {raw_capacity}"))
        })?;

        let dark_read_table = identifier_param(params, "dark_read_table")?;
        let probability = match params.get("dark_read_probability").map(|raw| raw.trim()) {
            None | Some("") => 0,
            Some(raw) => match raw.parse::<u32>() {
                Ok(percent) if percent <= 100 => percent,
                _ => {
                    return Err(VindexError::config(
                        KIND,
                        format!("dark_read_probability must be an integer between 0 and 100: {raw}"),
                    ))
                }
            },
        };
        let sync = match params.get("sync_dark_read").map(String::as_str) {
            None | Some("") | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(VindexError::config(
                    KIND,
                    format!("sync_dark_read value must be 'true' or 'false': '{other}'"),
                ))
            }
        };
        let dark_read = match dark_read_table {
            Some(lookup_table) => Some(DarkRead {
                lookup: Arc::new(LookupHashUnique::from_params(
                    &format!("{name}.dark_read"),
                    LookupParams {
                        table: lookup_table,
                        from: from.clone(),
                        to: to.clone(),
                        write_only: false,
                        autocommit: false,
                        owner: Some(table.clone()),
                    },
                )),
                probability,
                sync,
            }),
            None if probability > 0 => {
                return Err(VindexError::config(
                    KIND,
                    "dark_read_table is required when dark_read_probability is set",
                ))
            }
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            table,
            from,
            to,
            capacity,
            cache: KeyspaceIdCache::new(usize::try_from(capacity).unwrap_or(usize::MAX)),
            batch_size: env.settings.batch_size.max(1),
            dark_read,
            verification_timeout: env.settings.verification_timeout,
            breaker: Arc::new(VerificationBreaker::new(
                name,
                env.settings.breaker_threshold,
                env.settings.breaker_cooldown,
            )),
            metrics: env.metrics.clone(),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn cache_items(&self) -> BTreeMap<String, Vec<u8>> {
        self.cache.items()
    }

    /// Overrides the dark-read policy; a no-op without a dark-read partner.
    pub fn set_dark_read(&mut self, probability: u32, sync: bool) {
        if let Some(dark_read) = &mut self.dark_read {
            dark_read.probability = probability.min(100);
            dark_read.sync = sync;
        }
    }

    /// Resolves `ids` with batched scatter queries. Each batch is validated
    /// in full before any of it is cached.
    async fn resolve_misses(
        &self,
        cursor: &dyn VCursor,
        ids: &[Value],
    ) -> Result<HashMap<String, Vec<u8>>> {
        let (table, from, to) = (&self.table, &self.from, &self.to);
        let sql = format!("select {from}, {to} from {table} where {from} in ::{from}");
        let mut resolved = HashMap::with_capacity(ids.len());

        for batch in ids.chunks(self.batch_size) {
            let query = BoundQuery::new(sql.clone())
                .bind(from.clone(), BindVar::Tuple(batch.to_vec()))
                .force_scatter();
            let result = match cursor
                .execute("VindexScatterCacheLookup", query, CommitOrder::Normal)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    self.metrics
                        .lookup_failures
                        .add(&[table.as_str(), failure::SELECT_QUERY_FAILURE], 1);
                    return Err(VindexError::query(MAP_CONTEXT, err));
                }
            };

            let mut found: HashMap<String, Vec<u8>> = HashMap::with_capacity(result.rows.len());
            for row in &result.rows {
                if row.len() != 2 {
                    self.metrics
                        .lookup_failures
                        .add(&[table.as_str(), failure::RESULT_COLUMN_NUMBER_MISMATCH], 1);
                    return Err(VindexError::internal(
                        MAP_CONTEXT,
                        format!("expected 2 columns, got {}", row.len()),
                    ));
                }
                let Some(key) = row[0].cache_key() else {
                    continue;
                };
                let value = row[1].to_u64().map_err(|err| {
                    self.metrics
                        .lookup_failures
                        .add(&[table.as_str(), failure::VALUE_PARSING_ERROR], 1);
                    err.context(MAP_CONTEXT)
                })?;
                if found.contains_key(&key) {
                    self.metrics
                        .lookup_failures
                        .add(&[table.as_str(), failure::MULTIPLE_RESULTS], 1);
                    return Err(VindexError::internal(
                        MAP_CONTEXT,
                        format!("unexpected multiple results from vindex {table}, key {key}"),
                    ));
                }
                found.insert(key, vhash(value).to_vec());
            }
            for (key, ksid) in found {
                self.cache.set(key.clone(), ksid.clone());
                resolved.insert(key, ksid);
            }
        }
        Ok(resolved)
    }

    fn dark_read_task(&self, ids: &[Value], answers: &[Destination]) -> Option<DarkReadTask> {
        let dark_read = self.dark_read.as_ref()?;
        let roll = dark_read.probability >= 100
            || (dark_read.probability > 0
                && rand::thread_rng().gen_range(0..100) < dark_read.probability);
        if !roll {
            return None;
        }
        let (ids, expected): (Vec<Value>, Vec<Destination>) = ids
            .iter()
            .zip(answers)
            .filter(|(id, _)| !id.is_null())
            .map(|(id, dest)| (id.clone(), dest.clone()))
            .unzip();
        if ids.is_empty() {
            return None;
        }
        Some(DarkReadTask {
            vindex: self.name.clone(),
            lookup: dark_read.lookup.clone(),
            ids,
            expected,
            timeout: self.verification_timeout,
            breaker: self.breaker.clone(),
            metrics: self.metrics.clone(),
        })
    }

    fn dark_read_is_sync(&self) -> bool {
        self.dark_read.as_ref().is_some_and(|dark_read| dark_read.sync)
    }
}

/// One owned dark read, runnable inline or on a spawned task.
struct DarkReadTask {
    vindex: String,
    lookup: Arc<LookupHashUnique>,
    ids: Vec<Value>,
    expected: Vec<Destination>,
    timeout: Duration,
    breaker: Arc<VerificationBreaker>,
    metrics: Arc<VindexMetrics>,
}

impl DarkReadTask {
    async fn run(self, cursor: &dyn VCursor) {
        let verdict = self
            .breaker
            .run(self.timeout, self.lookup.map(cursor, &self.ids))
            .await;
        let vindex = self.vindex.as_str();
        let got = match verdict {
            Verdict::Completed(got) => got,
            Verdict::Failed(err) => {
                warn!(vindex = %vindex, error = %err, "dark read lookup failed");
                self.metrics.dark_reads.add(&[vindex, outcome::FAIL_TO_LOOKUP], 1);
                return;
            }
            Verdict::TimedOut => {
                self.metrics.dark_reads.add(&[vindex, outcome::TIMEOUT], 1);
                return;
            }
            Verdict::Skipped => {
                self.metrics.record_verification_skipped();
                self.metrics
                    .dark_reads
                    .add(&[vindex, outcome::SKIPPED_BREAKER_OPEN], 1);
                return;
            }
        };
        if got.len() != self.expected.len() {
            self.metrics
                .dark_reads
                .add(&[vindex, outcome::RESULT_LENGTH_MISMATCH], 1);
            return;
        }
        for ((id, expected), got) in self.ids.iter().zip(&self.expected).zip(&got) {
            let label = match (expected, got) {
                (expected, got) if expected == got => outcome::RESULT_MATCH,
                (Destination::KeyspaceId(_), Destination::None) => outcome::LOOKUP_MISSING,
                _ => outcome::RESULT_MISMATCH,
            };
            if label != outcome::RESULT_MATCH {
                debug!(vindex = %vindex, id = %id, scatter = %expected, lookup = %got, "dark read disagreement");
            }
            self.metrics.dark_reads.add(&[vindex, label], 1);
        }
    }
}

impl Vindex for ScatterCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    fn cost(&self) -> i32 {
        30
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

    fn cache_stats(&self) -> Option<CacheStats> {
        Some(self.cache.stats())
    }
}

#[async_trait]
impl SingleColumn for ScatterCache {
    async fn map(&self, cursor: &dyn VCursor, ids: &[Value]) -> Result<Vec<Destination>> {
        if self.capacity == 0 {
            return Ok(Destination::all_shards(ids.len()));
        }
        let started = Instant::now();

        let mut out: Vec<Option<Destination>> = Vec::with_capacity(ids.len());
        let mut misses = Vec::new();
        let mut hits = 0u64;
        for id in ids {
            let Some(key) = id.cache_key() else {
                out.push(Some(Destination::None));
                continue;
            };
            match self.cache.get(&key) {
                Some(ksid) => {
                    hits += 1;
                    out.push(Some(Destination::KeyspaceId(ksid)));
                }
                None => {
                    out.push(None);
                    misses.push(id.clone());
                }
            }
        }
        self.metrics
            .lookup_cached_size
            .add(&[self.table.as_str()], hits);
        self.metrics
            .lookup_query_size
            .add(&[self.table.as_str()], misses.len() as u64);

        let resolved = if misses.is_empty() {
            HashMap::new()
        } else {
            self.resolve_misses(cursor, &misses).await?
        };
        let out: Vec<Destination> = ids
            .iter()
            .zip(out)
            .map(|(id, slot)| {
                slot.unwrap_or_else(|| {
                    id.cache_key()
                        .and_then(|key| resolved.get(&key).cloned())
                        .map(Destination::KeyspaceId)
                        .unwrap_or(Destination::None)
                })
            })
            .collect();
        self.metrics
            .record_timing(&self.name, "map", started.elapsed());

        if let Some(task) = self.dark_read_task(ids, &out) {
            match cursor.detach() {
                Some(detached) if !self.dark_read_is_sync() => {
                    tokio::spawn(async move { task.run(detached.as_ref()).await });
                }
                _ => task.run(cursor).await,
            }
        }
        Ok(out)
    }

    /// Always true: rows are verified before they physically exist.
    async fn verify(
        &self,
        _cursor: &dyn VCursor,
        ids: &[Value],
        ksids: &[Vec<u8>],
    ) -> Result<Vec<bool>> {
        check_verify_lengths("ScatterCache.Verify", ids, ksids)?;
        Ok(vec![true; ids.len()])
    }
}

#[async_trait]
impl Lookup for ScatterCache {
    /// Primes the cache with the new rows; nothing is written. Either every
    /// row is cached or none is.
    async fn create(
        &self,
        _cursor: &dyn VCursor,
        rows: &[Vec<Value>],
        ksids: &[Vec<u8>],
        _ignore_mode: bool,
    ) -> Result<()> {
        single_column_rows("ScatterCache.Create", rows)?;
        if rows.len() != ksids.len() {
            return Err(VindexError::internal(
                "ScatterCache.Create",
                format!("got {} rows and {} keyspace ids", rows.len(), ksids.len()),
            ));
        }
        check_keyspace_ids("ScatterCache.Create", ksids)?;
        for (row, ksid) in rows.iter().zip(ksids) {
            if let Some(key) = row[0].cache_key() {
                self.cache.set(key, ksid.clone());
            }
        }
        Ok(())
    }

    async fn update(
        &self,
        _cursor: &dyn VCursor,
        _old_values: &[Value],
        _ksid: &[u8],
        _new_values: &[Value],
    ) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _cursor: &dyn VCursor, _rows: &[Vec<Value>], _ksid: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base(capacity: &str) -> Vec<(&'static str, String)> {
        vec![
            ("table", "t".to_string()),
            ("from", "fromc".to_string()),
            ("to", "toc".to_string()),
            ("capacity", capacity.to_string()),
        ]
    }

    fn build(pairs: &[(&str, String)]) -> Result<ScatterCache> {
        let params = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ScatterCache::new("scatter_cache", &params, &VindexEnv::default())
    }

    #[test]
    fn construction_errors() {
        let err = build(&base("-1")).err().unwrap();
        assert_eq!(
            err.to_string(),
            "scatter_cache: capacity contains illegal characters: -1"
        );

        let mut missing = base("10");
        missing.retain(|(k, _)| *k != "capacity");
        let err = build(&missing).err().unwrap();
        assert_eq!(err.to_string(), "scatter_cache: missing required field: capacity");

        let err = ScatterCache::new(
            "s",
            &params(&[("table", "t;drop"), ("from", "a"), ("to", "b"), ("capacity", "1")]),
            &VindexEnv::default(),
        )
        .err()
        .unwrap();
        assert_eq!(
            err.to_string(),
            "scatter_cache: table contains illegal characters: t;drop"
        );
    }

    #[test]
    fn dark_read_params_are_validated() {
        let mut pairs = base("10");
        pairs.push(("dark_read_probability", "50".to_string()));
        assert_eq!(
            build(&pairs).err().unwrap().to_string(),
            "scatter_cache: dark_read_table is required when dark_read_probability is set"
        );

        pairs.push(("dark_read_table", "vindex".to_string()));
        let vindex = build(&pairs).unwrap();
        assert!(vindex.dark_read.is_some());

        let mut pairs = base("10");
        pairs.push(("dark_read_table", "vindex".to_string()));
        pairs.push(("dark_read_probability", "101".to_string()));
        assert!(build(&pairs).is_err());
    }

    #[test]
    fn metadata() {
        let vindex = build(&base("1000")).unwrap();
        assert_eq!(vindex.cost(), 30);
        assert_eq!(vindex.name(), "scatter_cache");
        assert_eq!(vindex.capacity(), 1000);
        assert!(vindex.is_unique() && !vindex.is_functional() && vindex.needs_vcursor());
        assert_eq!(vindex.cache_stats().unwrap().capacity, 1000);
    }
}
