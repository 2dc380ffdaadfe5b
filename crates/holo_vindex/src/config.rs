//! Process-level settings shared by every vindex a registry builds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::decider::{Decider, FileDecider, StaticDecider};
use crate::metrics::VindexMetrics;

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_SAMPLE_CHECK_SIZE: usize = 10;
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Tunables for table-backed vindexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VindexSettings {
    /// Maximum ids per batched lookup query.
    pub batch_size: usize,
    /// Maximum ids re-resolved per sampling check.
    pub sample_check_size: usize,
    /// Capacity used when a cached lookup vindex has no valid `capacity`.
    pub default_cache_capacity: usize,
    /// Upper bound on one sampling check or dark read. Zero disables it.
    pub verification_timeout: Duration,
    /// Consecutive verification failures that pause verification reads.
    /// Zero never pauses.
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    /// Decider flag selecting the low cost for cached lookup vindexes.
    pub cost_flag: String,
    /// Decider flag enabling lookup sampling checks.
    pub sample_flag: String,
    /// JSON decider file; `None` uses an empty in-memory decider.
    pub decider_path: Option<PathBuf>,
    pub decider_reload_interval: Duration,
}

impl Default for VindexSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sample_check_size: DEFAULT_SAMPLE_CHECK_SIZE,
            default_cache_capacity: DEFAULT_CACHE_CAPACITY,
            verification_timeout: Duration::from_millis(250),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            cost_flag: "use_cached_lookup_vindex".to_string(),
            sample_flag: "cached_lookup_vindex_sample_check".to_string(),
            decider_path: None,
            decider_reload_interval: Duration::from_secs(30),
        }
    }
}

impl VindexSettings {
    /// Reads `HOLO_VINDEX_*` overrides on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let batch_size = parse_usize(
            std::env::var("HOLO_VINDEX_BATCH_SIZE").ok(),
            defaults.batch_size,
        )?
        .max(1);
        let sample_check_size = parse_usize(
            std::env::var("HOLO_VINDEX_SAMPLE_CHECK_SIZE").ok(),
            defaults.sample_check_size,
        )?;
        let default_cache_capacity = parse_usize(
            std::env::var("HOLO_VINDEX_DEFAULT_CACHE_CAPACITY").ok(),
            defaults.default_cache_capacity,
        )?;
        let verification_timeout_ms = parse_u64(
            std::env::var("HOLO_VINDEX_VERIFICATION_TIMEOUT_MS").ok(),
            defaults.verification_timeout.as_millis() as u64,
        )?;
        let breaker_threshold = parse_u32(
            std::env::var("HOLO_VINDEX_BREAKER_THRESHOLD").ok(),
            defaults.breaker_threshold,
        )?;
        let breaker_cooldown_ms = parse_u64(
            std::env::var("HOLO_VINDEX_BREAKER_COOLDOWN_MS").ok(),
            defaults.breaker_cooldown.as_millis() as u64,
        )?;
        let cost_flag = std::env::var("HOLO_VINDEX_COST_FLAG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.cost_flag);
        let sample_flag = std::env::var("HOLO_VINDEX_SAMPLE_FLAG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.sample_flag);
        let decider_path = std::env::var("HOLO_VINDEX_DECIDER_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let decider_reload_ms = parse_u64(
            std::env::var("HOLO_VINDEX_DECIDER_RELOAD_MS").ok(),
            defaults.decider_reload_interval.as_millis() as u64,
        )?;

        Ok(Self {
            batch_size,
            sample_check_size,
            default_cache_capacity,
            verification_timeout: Duration::from_millis(verification_timeout_ms),
            breaker_threshold,
            breaker_cooldown: Duration::from_millis(breaker_cooldown_ms),
            cost_flag,
            sample_flag,
            decider_path,
            decider_reload_interval: Duration::from_millis(decider_reload_ms.max(1)),
        })
    }
}

/// Collaborators injected into every vindex at construction.
#[derive(Clone)]
pub struct VindexEnv {
    pub decider: Arc<dyn Decider>,
    pub metrics: Arc<VindexMetrics>,
    pub settings: VindexSettings,
    file_decider: Option<Arc<FileDecider>>,
}

impl Default for VindexEnv {
    fn default() -> Self {
        Self::new(VindexSettings::default(), Arc::new(StaticDecider::new()))
    }
}

impl VindexEnv {
    pub fn new(settings: VindexSettings, decider: Arc<dyn Decider>) -> Self {
        Self {
            decider,
            metrics: Arc::new(VindexMetrics::default()),
            settings,
            file_decider: None,
        }
    }

    /// Builds the environment described by `settings`, opening the decider
    /// file when one is configured.
    pub fn from_settings(settings: VindexSettings) -> Self {
        match settings.decider_path.clone() {
            Some(path) => {
                info!(path = %path.display(), "using file decider");
                let file_decider = Arc::new(FileDecider::open(path));
                Self {
                    decider: file_decider.clone(),
                    metrics: Arc::new(VindexMetrics::default()),
                    settings,
                    file_decider: Some(file_decider),
                }
            }
            None => Self::new(settings, Arc::new(StaticDecider::new())),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<VindexMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Starts polling the decider file. `None` without a file decider.
    pub fn spawn_decider_reload(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.file_decider.as_ref().map(|decider| {
            decider
                .clone()
                .spawn_reload_loop(self.settings.decider_reload_interval)
        })
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u32(value: Option<String>, default_value: u32) -> Result<u32> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid u32 value: {raw}")),
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "HOLO_VINDEX_BATCH_SIZE",
        "HOLO_VINDEX_SAMPLE_CHECK_SIZE",
        "HOLO_VINDEX_DEFAULT_CACHE_CAPACITY",
        "HOLO_VINDEX_VERIFICATION_TIMEOUT_MS",
        "HOLO_VINDEX_BREAKER_THRESHOLD",
        "HOLO_VINDEX_BREAKER_COOLDOWN_MS",
        "HOLO_VINDEX_COST_FLAG",
        "HOLO_VINDEX_SAMPLE_FLAG",
        "HOLO_VINDEX_DECIDER_PATH",
        "HOLO_VINDEX_DECIDER_RELOAD_MS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_overrides() {
        clear_env();
        let settings = VindexSettings::from_env().unwrap();
        assert_eq!(settings, VindexSettings::default());
        assert_eq!(settings.batch_size, 200);
        assert_eq!(settings.sample_check_size, 10);
        assert_eq!(settings.default_cache_capacity, 10_000);
    }

    #[test]
    #[serial]
    fn overrides_are_parsed() {
        clear_env();
        std::env::set_var("HOLO_VINDEX_BATCH_SIZE", "0");
        std::env::set_var("HOLO_VINDEX_VERIFICATION_TIMEOUT_MS", "75");
        std::env::set_var("HOLO_VINDEX_SAMPLE_FLAG", "sample_me");
        std::env::set_var("HOLO_VINDEX_DECIDER_PATH", "/tmp/decider.json");
        let settings = VindexSettings::from_env().unwrap();
        clear_env();

        assert_eq!(settings.batch_size, 1);
        assert_eq!(settings.verification_timeout, Duration::from_millis(75));
        assert_eq!(settings.sample_flag, "sample_me");
        assert_eq!(settings.decider_path, Some(PathBuf::from("/tmp/decider.json")));
    }

    #[test]
    #[serial]
    fn malformed_numbers_are_rejected() {
        clear_env();
        std::env::set_var("HOLO_VINDEX_BREAKER_THRESHOLD", "many");
        let err = VindexSettings::from_env().unwrap_err();
        clear_env();
        assert!(err.to_string().contains("invalid u32 value: many"));
    }

    #[test]
    fn file_decider_is_opened_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decider.json");
        std::fs::write(&path, r#"{"use_cached_lookup_vindex": 100}"#).unwrap();
        let env = VindexEnv::from_settings(VindexSettings {
            decider_path: Some(path),
            ..VindexSettings::default()
        });
        assert!(env.decider.check("use_cached_lookup_vindex", false));
        assert!(env.file_decider.is_some());
        assert!(VindexEnv::default().spawn_decider_reload().is_none());
    }
}
