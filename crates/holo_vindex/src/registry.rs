//! Name-indexed vindex factories.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::cached_lookup::{self, CachedLookupHashUnique};
use crate::config::VindexEnv;
use crate::error::{Result, VindexError};
use crate::hash::{self, Hash};
use crate::hash_offset::{self, HashOffset};
use crate::lookup::{self, LookupHashUnique};
use crate::scatter_cache::{self, ScatterCache};
use crate::vindex::Vindex;

/// Builds one vindex instance from its name, flat params and the shared
/// environment.
pub type VindexFactory =
    fn(name: &str, params: &BTreeMap<String, String>, env: &VindexEnv) -> Result<Arc<dyn Vindex>>;

pub struct Registry {
    factories: BTreeMap<String, VindexFactory>,
    env: VindexEnv,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(VindexEnv::default())
    }
}

impl Registry {
    /// A registry holding every built-in kind.
    pub fn new(env: VindexEnv) -> Self {
        let mut registry = Self::empty(env);
        registry.register(hash::KIND, |name, _, _| Ok(Arc::new(Hash::new(name))));
        registry.register(hash_offset::KIND, |name, params, _| {
            Ok(Arc::new(HashOffset::new(name, params)?))
        });
        registry.register(lookup::KIND, |name, params, _| {
            Ok(Arc::new(LookupHashUnique::new(name, params)?))
        });
        registry.register(cached_lookup::KIND, |name, params, env| {
            Ok(Arc::new(CachedLookupHashUnique::new(name, params, env)?))
        });
        registry.register(scatter_cache::KIND, |name, params, env| {
            Ok(Arc::new(ScatterCache::new(name, params, env)?))
        });
        registry
    }

    pub fn empty(env: VindexEnv) -> Self {
        Self {
            factories: BTreeMap::new(),
            env,
        }
    }

    /// Adds or replaces the factory for `kind`.
    pub fn register(&mut self, kind: &str, factory: VindexFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn create(
        &self,
        kind: &str,
        name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Vindex>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| VindexError::UnknownKind(kind.to_string()))?;
        let vindex = factory(name, params, &self.env)?;
        debug!(vindex = %name, kind, cost = vindex.cost(), "vindex created");
        Ok(vindex)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn env(&self) -> &VindexEnv {
        &self.env
    }
}
