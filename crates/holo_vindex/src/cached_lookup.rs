//! Lookup vindex with an in-process keyspace id cache.
//!
//! Resolved mappings never change, so cached entries are served without
//! revalidation. Misses are resolved with batched `in` queries against the
//! side table. When the sampling flag is on, a handful of freshly resolved
//! ids are re-read from the owning table (force scatter) and the agreement
//! is counted in [`VindexMetrics::serving_verification`]; sampling never
//! changes the answer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::breaker::{Verdict, VerificationBreaker};
use crate::cache::{CacheStats, KeyspaceIdCache};
use crate::config::{VindexEnv, VindexSettings};
use crate::decider::Decider;
use crate::destination::Destination;
use crate::error::{Result, VindexError};
use crate::keyspace_id::{vhash, vunhash};
use crate::lookup::{check_keyspace_ids, single_column_rows, LookupHashUnique, LookupParams};
use crate::metrics::{failure, outcome, VindexMetrics};
use crate::value::Value;
use crate::vindex::{
    check_verify_lengths, BindVar, BoundQuery, CommitOrder, Lookup, SingleColumn, VCursor, Vindex,
};

pub const KIND: &str = "cached_lookup_hash_unique";

const MAP_CONTEXT: &str = "CachedLookupHashUnique.Map";

pub struct CachedLookupHashUnique {
    /// Uncached resolver used for Verify and side-table writes.
    inner: LookupHashUnique,
    /// Resolved `from` values to keyspace ids.
    cache: KeyspaceIdCache,
    /// Owning table re-read by sampling checks.
    source_table: String,
    /// Source of the cost and sampling flags.
    decider: Arc<dyn Decider>,
    metrics: Arc<VindexMetrics>,
    settings: VindexSettings,
    /// Pauses sampling checks after repeated failures.
    breaker: VerificationBreaker,
}

impl CachedLookupHashUnique {
    /// Builds the vindex. An absent or unparsable `capacity` falls back to
    /// the configured default.
    pub fn new(name: &str, params: &BTreeMap<String, String>, env: &VindexEnv) -> Result<Self> {
        let lookup = LookupParams::parse(KIND, params)?;
        let capacity = match params.get("capacity").map(|raw| raw.trim().parse::<u64>()) {
            Some(Ok(capacity)) => usize::try_from(capacity).unwrap_or(usize::MAX),
            Some(Err(err)) => {
                warn!(
                    vindex = %name,
                    error = %err,
                    default_capacity = env.settings.default_cache_capacity,
                    "failed to parse capacity; using the default"
                );
                env.settings.default_cache_capacity
            }
            None => env.settings.default_cache_capacity,
        };
        let source_table = lookup
            .owner
            .clone()
            .unwrap_or_else(|| source_table_for(&lookup.table));
        Ok(Self {
            inner: LookupHashUnique::from_params(name, lookup),
            cache: KeyspaceIdCache::new(capacity),
            source_table,
            decider: env.decider.clone(),
            metrics: env.metrics.clone(),
            settings: env.settings.clone(),
            breaker: VerificationBreaker::new(
                name,
                env.settings.breaker_threshold,
                env.settings.breaker_cooldown,
            ),
        })
    }

    fn params(&self) -> &LookupParams {
        self.inner.params()
    }

    /// Owning table re-read by sampling checks.
    pub fn source_table(&self) -> &str {
        &self.source_table
    }

    pub fn cache_items(&self) -> BTreeMap<String, Vec<u8>> {
        self.cache.items()
    }

    fn fail(&self, reason: &str, message: String) -> VindexError {
        self.metrics
            .lookup_failures
            .add(&[self.params().table.as_str(), reason], 1);
        VindexError::internal(MAP_CONTEXT, message)
    }

    /// Resolves `ids` with batched side-table queries, caching every row.
    async fn resolve_misses(
        &self,
        cursor: &dyn VCursor,
        ids: &[Value],
    ) -> Result<HashMap<u64, u64>> {
        let LookupParams {
            table, from, to, ..
        } = self.params();
        let sql = format!("select {from}, {to} from {table} where {from} in ::{from}");
        let mut resolved = HashMap::with_capacity(ids.len());

        for batch in ids.chunks(self.settings.batch_size.max(1)) {
            let query =
                BoundQuery::new(sql.clone()).bind(from.clone(), BindVar::Tuple(batch.to_vec()));
            let result = match cursor
                .execute("CachedLookupHashUnique.Lookup", query, CommitOrder::Autocommit)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    self.metrics
                        .lookup_failures
                        .add(&[table.as_str(), failure::SELECT_QUERY_FAILURE], 1);
                    return Err(VindexError::query(
                        format!("{MAP_CONTEXT}: Select query execution error"),
                        err,
                    ));
                }
            };

            if result.rows.len() > batch.len() {
                return Err(self.fail(
                    failure::RESULT_ROW_NUMBER_MISMATCH,
                    format!(
                        "More result than expected. Expected size {} rows. Got {}",
                        batch.len(),
                        result.rows.len()
                    ),
                ));
            }
            let mut rows = Vec::with_capacity(result.rows.len());
            for row in &result.rows {
                if row.len() != 2 {
                    return Err(self.fail(
                        failure::RESULT_COLUMN_NUMBER_MISMATCH,
                        format!("Internal error. Expected 2 columns. Got {}", row.len()),
                    ));
                }
                let key = row[0].to_u64().map_err(|err| {
                    self.fail(
                        failure::KEY_PARSING_ERROR,
                        format!("Result key parsing error. {err}"),
                    )
                })?;
                let value = row[1].to_u64().map_err(|err| {
                    self.fail(
                        failure::VALUE_PARSING_ERROR,
                        format!("Result value parsing error. {err}"),
                    )
                })?;
                rows.push((key, value));
            }
            for (key, value) in rows {
                self.cache.set(key.to_string(), vhash(value).to_vec());
                resolved.insert(key, value);
            }
        }
        Ok(resolved)
    }

    /// Re-reads sampled ids from the owning table and counts agreement.
    async fn check_sample(&self, cursor: &dyn VCursor, samples: &[(Value, Vec<u8>)]) -> Result<()> {
        let LookupParams { from, to, .. } = self.params();
        let sql = format!(
            "select {from}, {to} from {} where {from} in ::{from}",
            self.source_table
        );
        let ids: Vec<Value> = samples.iter().map(|(id, _)| id.clone()).collect();
        let query = BoundQuery::new(sql)
            .bind(from.clone(), BindVar::Tuple(ids))
            .force_scatter();
        let result = cursor
            .execute("CachedLookupHashUnique.CheckSample", query, CommitOrder::Normal)
            .await
            .map_err(|err| VindexError::query("CachedLookupHashUnique.CheckSample", err))?;

        let expected: HashMap<u64, &[u8]> = samples
            .iter()
            .filter_map(|(id, ksid)| id.to_u64().ok().map(|key| (key, ksid.as_slice())))
            .collect();
        let name = self.inner.name();
        for row in &result.rows {
            let label = if row.len() != 2 {
                outcome::RESULT_LENGTH_MISMATCH
            } else {
                match (row[0].to_u64(), row[1].to_u64()) {
                    (Ok(key), Ok(value)) => match expected.get(&key) {
                        Some(ksid) if *ksid == vhash(value).as_slice() => outcome::RESULT_MATCH,
                        _ => outcome::RESULT_MISMATCH,
                    },
                    _ => outcome::FAIL_TO_PARSE_RESULT,
                }
            };
            if label == outcome::RESULT_MISMATCH {
                debug!(vindex = %name, row = ?row, "sampled row disagrees with lookup table");
            }
            self.metrics.serving_verification.add(&[name, label], 1);
        }
        Ok(())
    }

    async fn sample(&self, cursor: &dyn VCursor, ids: &[Value], out: &[Destination]) {
        let samples: Vec<(Value, Vec<u8>)> = ids
            .iter()
            .zip(out)
            .filter_map(|(id, dest)| dest.keyspace_id().map(|ksid| (id.clone(), ksid.to_vec())))
            .take(self.settings.sample_check_size)
            .collect();
        if samples.is_empty() {
            return;
        }
        let name = self.inner.name();
        let label = match self
            .breaker
            .run(
                self.settings.verification_timeout,
                self.check_sample(cursor, &samples),
            )
            .await
        {
            Verdict::Completed(()) => return,
            Verdict::Failed(err) => {
                warn!(vindex = %name, error = %err, "lookup sampling check failed");
                outcome::FAIL_TO_LOOKUP
            }
            Verdict::TimedOut => outcome::TIMEOUT,
            Verdict::Skipped => {
                self.metrics.record_verification_skipped();
                outcome::SKIPPED_BREAKER_OPEN
            }
        };
        self.metrics.serving_verification.add(&[name, label], 1);
    }
}

/// Guesses the owning table of a lookup table named `<entity>_id_idx`.
pub fn source_table_for(lookup_table: &str) -> String {
    let base = lookup_table.strip_suffix("_id_idx").unwrap_or(lookup_table);
    if base.ends_with('s') || base.ends_with("_history") {
        base.to_string()
    } else {
        format!("{base}s")
    }
}

impl Vindex for CachedLookupHashUnique {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    /// Cheap while the cost flag is on; otherwise priced above scatter
    /// resolution (30), so the planner picks a scatter cache over it.
    fn cost(&self) -> i32 {
        if self.decider.check(&self.settings.cost_flag, false) {
            10
        } else {
            40
        }
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
impl SingleColumn for CachedLookupHashUnique {
    async fn map(&self, cursor: &dyn VCursor, ids: &[Value]) -> Result<Vec<Destination>> {
        if self.params().write_only {
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
        let table = self.params().table.as_str();
        self.metrics.lookup_cached_size.add(&[table], hits);
        self.metrics
            .lookup_query_size
            .add(&[table], misses.len() as u64);

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
                    match id.to_u64().ok().and_then(|key| resolved.get(&key)) {
                        Some(value) => Destination::hashed(*value),
                        None => {
                            debug!(vindex = %self.inner.name(), id = %id, "no lookup row for id");
                            Destination::None
                        }
                    }
                })
            })
            .collect();
        self.metrics
            .record_timing(self.inner.name(), "map", started.elapsed());

        if self.decider.check(&self.settings.sample_flag, false) {
            self.sample(cursor, ids, &out).await;
        }
        Ok(out)
    }

    /// Null, non-numeric and zero ids pass without a lookup; the rest are
    /// checked against the side table.
    async fn verify(
        &self,
        cursor: &dyn VCursor,
        ids: &[Value],
        ksids: &[Vec<u8>],
    ) -> Result<Vec<bool>> {
        check_verify_lengths("CachedLookupHashUnique.Verify", ids, ksids)?;
        let mut out = vec![true; ids.len()];
        let mut positions = Vec::new();
        let mut to_verify = Vec::new();
        let mut ksids_to_verify = Vec::new();
        for (idx, (id, ksid)) in ids.iter().zip(ksids).enumerate() {
            if id.is_null() {
                continue;
            }
            match id.to_u64() {
                Ok(0) => {}
                Ok(_) => {
                    positions.push(idx);
                    to_verify.push(id.clone());
                    ksids_to_verify.push(ksid.clone());
                }
                Err(err) => {
                    warn!(vindex = %self.inner.name(), id = %id, error = %err, "skipping verification of unparsable id");
                }
            }
        }
        if to_verify.is_empty() {
            return Ok(out);
        }
        let verified = self
            .inner
            .verify(cursor, &to_verify, &ksids_to_verify)
            .await
            .map_err(|err| err.context("CachedLookupHashUnique.Verify"))?;
        for (idx, ok) in positions.into_iter().zip(verified) {
            out[idx] = ok;
        }
        Ok(out)
    }
}

#[async_trait]
impl Lookup for CachedLookupHashUnique {
    /// Records the rows in the side table, then primes the cache. Nothing
    /// is cached when the insert fails.
    async fn create(
        &self,
        cursor: &dyn VCursor,
        rows: &[Vec<Value>],
        ksids: &[Vec<u8>],
        ignore_mode: bool,
    ) -> Result<()> {
        single_column_rows("CachedLookupHashUnique.Create", rows)?;
        check_keyspace_ids("CachedLookupHashUnique.Create", ksids)?;
        self.inner.create(cursor, rows, ksids, ignore_mode).await?;
        for (row, ksid) in rows.iter().zip(ksids) {
            if let Some(key) = row[0].cache_key() {
                self.cache.set(key, ksid.clone());
            }
        }
        Ok(())
    }

    /// Refreshes the cache for the new value. The side table is maintained
    /// out of band for updates.
    async fn update(
        &self,
        _cursor: &dyn VCursor,
        _old_values: &[Value],
        ksid: &[u8],
        new_values: &[Value],
    ) -> Result<()> {
        let [new_value] = new_values else {
            return Err(VindexError::internal(
                "CachedLookupHashUnique.Update",
                "multi-col keys unsupported",
            ));
        };
        vunhash(ksid).map_err(|err| err.context("CachedLookupHashUnique.Update"))?;
        if let Some(key) = new_value.cache_key() {
            self.cache.set(key, ksid.to_vec());
        }
        Ok(())
    }

    async fn delete(&self, _cursor: &dyn VCursor, _rows: &[Vec<Value>], _ksid: &[u8]) -> Result<()> {
        Ok(())
    }
}
