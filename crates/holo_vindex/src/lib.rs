//! Shard resolution ("vindexes") for a sharding-aware query router.
//!
//! A vindex maps a column value to the keyspace id of the shard that owns
//! the row. Functional kinds compute it ([`hash`], [`hash_offset`]);
//! table-backed kinds look it up ([`lookup`], [`cached_lookup`],
//! [`scatter_cache`]). The [`registry`] builds instances by kind and
//! [`vschema`] builds a whole schema's worth from JSON.

pub mod breaker;
pub mod cache;
pub mod cached_lookup;
pub mod config;
pub mod decider;
pub mod destination;
pub mod error;
pub mod hash;
pub mod hash_offset;
pub mod keyspace_id;
pub mod lookup;
pub mod metrics;
pub mod registry;
pub mod scatter_cache;
pub mod value;
pub mod vindex;
pub mod vschema;

pub use cache::CacheStats;
pub use cached_lookup::CachedLookupHashUnique;
pub use config::{VindexEnv, VindexSettings};
pub use decider::{Decider, FileDecider, StaticDecider};
pub use destination::Destination;
pub use error::{Result, VindexError};
pub use hash::Hash;
pub use hash_offset::HashOffset;
pub use keyspace_id::{vhash, vunhash};
pub use lookup::LookupHashUnique;
pub use metrics::VindexMetrics;
pub use registry::Registry;
pub use scatter_cache::ScatterCache;
pub use value::Value;
pub use vindex::{
    BindVar, BoundQuery, CommitOrder, Lookup, QueryResult, Reversible, SingleColumn, VCursor,
    Vindex,
};
pub use vschema::{VSchema, VindexSet, VindexSpec};
