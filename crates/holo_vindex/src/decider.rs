//! Runtime feature flags ("deciders") polled by vindexes on each call.
//!
//! A decider value is a percentage. A positive value enables the flag for
//! that share of checks; zero or an absent flag falls back to the caller's
//! default. Vindexes receive an `Arc<dyn Decider>` at construction, so flags
//! can change without rebuilding the schema.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;

pub trait Decider: Send + Sync {
    fn check(&self, name: &str, default: bool) -> bool;
}

fn roll(percent: Option<i64>, default: bool) -> bool {
    match percent {
        Some(value) if value >= 100 => true,
        Some(value) if value > 0 => rand::thread_rng().gen_range(0..100) < value,
        _ => default,
    }
}

/// In-memory decider for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticDecider {
    values: RwLock<HashMap<String, i64>>,
}

impl StaticDecider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, percent: i64) -> Self {
        self.set(name, percent);
        self
    }

    pub fn set(&self, name: &str, percent: i64) {
        self.values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), percent);
    }

    pub fn clear(&self, name: &str) {
        self.values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
    }
}

impl Decider for StaticDecider {
    fn check(&self, name: &str, default: bool) -> bool {
        let percent = self
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .copied();
        roll(percent, default)
    }
}

/// Decider backed by a JSON file of `{ "flag": percent }` entries.
///
/// The file is re-read when its modification time advances. A missing or
/// malformed file keeps the last good values.
#[derive(Debug)]
pub struct FileDecider {
    path: PathBuf,
    values: RwLock<HashMap<String, i64>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl FileDecider {
    /// Creates the decider and performs a best-effort initial load.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let decider = Self {
            path: path.into(),
            values: RwLock::new(HashMap::new()),
            last_modified: Mutex::new(None),
        };
        if let Err(err) = decider.reload_if_changed() {
            warn!(path = %decider.path.display(), error = %err, "decider initial load failed");
        }
        decider
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reloads the file when it changed since the last successful load.
    ///
    /// Returns `true` when new values were installed.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let modified = std::fs::metadata(&self.path)?.modified()?;
        {
            let last = self
                .last_modified
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if last.is_some_and(|last| modified <= last) {
                return Ok(false);
            }
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let parsed: HashMap<String, i64> = serde_json::from_str(&raw)?;
        debug!(path = %self.path.display(), flags = parsed.len(), "decider values loaded");
        *self
            .values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = parsed;
        *self
            .last_modified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(modified);
        Ok(true)
    }

    /// Polls the file every `interval` until the returned task is aborted.
    pub fn spawn_reload_loop(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = self.reload_if_changed() {
                    warn!(path = %self.path.display(), error = %err, "decider reload failed");
                }
            }
        })
    }
}

impl Decider for FileDecider {
    fn check(&self, name: &str, default: bool) -> bool {
        let percent = self
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .copied();
        roll(percent, default)
    }
}
