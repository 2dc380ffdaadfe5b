//! In-process counters for vindex resolution and live verification.
//!
//! Labelled counters are keyed by dot-joined label values
//! (`"<vindex>.<outcome>"`), mirroring how they are exported. Cache
//! counters live on each [`crate::cache::KeyspaceIdCache`] instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Lookup failure reasons recorded against the backing table.
pub mod failure {
    pub const SELECT_QUERY_FAILURE: &str = "select_query_failure";
    pub const RESULT_ROW_NUMBER_MISMATCH: &str = "result_row_number_mismatch";
    pub const RESULT_COLUMN_NUMBER_MISMATCH: &str = "result_column_number_mismatch";
    pub const KEY_PARSING_ERROR: &str = "key_parsing_error";
    pub const VALUE_PARSING_ERROR: &str = "value_parsing_error";
    pub const MULTIPLE_RESULTS: &str = "multiple_results";
}

/// Outcomes of comparing a vindex answer with a second opinion.
pub mod outcome {
    pub const RESULT_MATCH: &str = "result_match";
    pub const RESULT_MISMATCH: &str = "result_mismatch";
    pub const RESULT_LENGTH_MISMATCH: &str = "result_length_mismatch";
    pub const FAIL_TO_PARSE_RESULT: &str = "fail_to_parse_result";
    pub const FAIL_TO_LOOKUP: &str = "fail_to_lookup";
    pub const TIMEOUT: &str = "timeout";
    pub const SKIPPED_BREAKER_OPEN: &str = "skipped_breaker_open";
    pub const LOOKUP_MISSING: &str = "lookup_missing";
}

/// Counter family partitioned by label values.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    inner: Mutex<BTreeMap<String, u64>>,
}

impl LabeledCounter {
    pub fn add(&self, labels: &[&str], delta: u64) {
        let mut counts = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = counts.entry(labels.join(".")).or_default();
        *entry = entry.saturating_add(delta);
    }

    pub fn get(&self, labels: &[&str]) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&labels.join("."))
            .copied()
            .unwrap_or(0)
    }

    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn reset(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

/// Aggregate latency for one `<vindex>.<operation>` pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimingStats {
    pub count: u64,
    pub total_ns: u64,
    pub max_ns: u64,
}

/// Shared metrics sink injected into every vindex built by a registry.
#[derive(Debug, Default)]
pub struct VindexMetrics {
    /// Ids sent to the backing store per table.
    pub lookup_query_size: LabeledCounter,
    /// Ids served from cache per table.
    pub lookup_cached_size: LabeledCounter,
    /// `<table>.<reason>` failures that aborted a Map call.
    pub lookup_failures: LabeledCounter,
    /// `<vindex>.<outcome>` results of lookup-table sampling checks.
    pub serving_verification: LabeledCounter,
    /// `<vindex>.<outcome>` results of scatter-vs-lookup dark reads.
    pub dark_reads: LabeledCounter,
    /// Verification reads skipped because their breaker was open.
    verification_skipped: AtomicU64,
    timings: Mutex<BTreeMap<String, TimingStats>>,
}

/// Immutable copy of [`VindexMetrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct VindexMetricsSnapshot {
    pub lookup_query_size: BTreeMap<String, u64>,
    pub lookup_cached_size: BTreeMap<String, u64>,
    pub lookup_failures: BTreeMap<String, u64>,
    pub serving_verification: BTreeMap<String, u64>,
    pub dark_reads: BTreeMap<String, u64>,
    pub verification_skipped: u64,
    pub timings: BTreeMap<String, TimingStats>,
}

impl VindexMetrics {
    pub fn record_timing(&self, vindex: &str, operation: &str, elapsed: Duration) {
        let elapsed_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let mut timings = self
            .timings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stats = timings.entry(format!("{vindex}.{operation}")).or_default();
        stats.count = stats.count.saturating_add(1);
        stats.total_ns = stats.total_ns.saturating_add(elapsed_ns);
        stats.max_ns = stats.max_ns.max(elapsed_ns);
    }

    pub fn record_verification_skipped(&self) {
        self.verification_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timing(&self, vindex: &str, operation: &str) -> TimingStats {
        self.timings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&format!("{vindex}.{operation}"))
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> VindexMetricsSnapshot {
        VindexMetricsSnapshot {
            lookup_query_size: self.lookup_query_size.counts(),
            lookup_cached_size: self.lookup_cached_size.counts(),
            lookup_failures: self.lookup_failures.counts(),
            serving_verification: self.serving_verification.counts(),
            dark_reads: self.dark_reads.counts(),
            verification_skipped: self.verification_skipped.load(Ordering::Relaxed),
            timings: self
                .timings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}
