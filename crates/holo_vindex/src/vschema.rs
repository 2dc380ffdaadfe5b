//! JSON vindex declarations and the instances built from them.
//!
//! ```json
//! {
//!   "vindexes": {
//!     "campaign_id": {
//!       "type": "scatter_cache",
//!       "owner": "campaigns",
//!       "params": { "table": "campaigns", "from": "id", "to": "g_advertiser_id", "capacity": "10000" }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheStats;
use crate::error::{Result, VindexError};
use crate::registry::Registry;
use crate::vindex::Vindex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSchema {
    #[serde(default)]
    pub vindexes: BTreeMap<String, VindexSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VindexSpec {
    #[serde(rename = "type")]
    pub kind: String,
    /// Table whose rows this vindex is maintained for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl VSchema {
    /// Parses a schema document, which must be a JSON object.
    pub fn from_json(raw: &str) -> Result<Self> {
        let document: serde_json::Value = serde_json::from_str(raw)?;
        if !document.is_object() {
            return Err(VindexError::config(
                "vschema",
                "document must be a JSON object",
            ));
        }
        Ok(serde_json::from_value(document)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    /// Constructs every declared vindex. The first failure aborts the build.
    ///
    /// A declared `owner` is passed to the factory as the `owner` param
    /// unless the params already name one.
    pub fn build(&self, registry: &Registry) -> Result<VindexSet> {
        let mut vindexes = BTreeMap::new();
        for (name, spec) in &self.vindexes {
            let mut params = spec.params.clone();
            if let Some(owner) = &spec.owner {
                params
                    .entry("owner".to_string())
                    .or_insert_with(|| owner.clone());
            }
            let vindex = registry
                .create(&spec.kind, name, &params)
                .map_err(|err| err.context(format!("vindex {name}")))?;
            vindexes.insert(name.clone(), vindex);
        }
        info!(vindexes = vindexes.len(), "vschema built");
        Ok(VindexSet { vindexes })
    }
}

/// The vindexes of one schema version.
#[derive(Clone, Default)]
pub struct VindexSet {
    vindexes: BTreeMap<String, Arc<dyn Vindex>>,
}

impl VindexSet {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Vindex>> {
        self.vindexes.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Vindex>)> {
        self.vindexes.iter().map(|(name, vindex)| (name.as_str(), vindex))
    }

    pub fn len(&self) -> usize {
        self.vindexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vindexes.is_empty()
    }

    /// Cache counters of every caching vindex, by name.
    pub fn cache_stats(&self) -> BTreeMap<String, CacheStats> {
        self.vindexes
            .iter()
            .filter_map(|(name, vindex)| vindex.cache_stats().map(|stats| (name.clone(), stats)))
            .collect()
    }
}
