//! Error taxonomy for vindex construction and resolution.
//!
//! Soft failures (sampling and dark-read disagreements) are never surfaced
//! through this type; they are recorded in [`crate::metrics::VindexMetrics`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VindexError {
    /// Bad or missing construction parameters. Fatal at schema-load time.
    #[error("{vindex}: {message}")]
    Config { vindex: String, message: String },

    /// Unknown vindex kind requested from the registry.
    #[error("vindex type {0:?} not found")]
    UnknownKind(String),

    /// The query collaborator failed to execute a statement.
    #[error("{context}: {source}")]
    Query {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// Malformed result shape, uniqueness violation or unparsable row data.
    #[error("{context}: {message}")]
    Internal { context: String, message: String },

    /// A destination that is not a well-formed 8-byte keyspace id.
    #[error("invalid keyspace id: {0}")]
    InvalidKeyspaceId(String),

    /// A column value that cannot be converted to the requested type.
    #[error("could not parse value: '{0}'")]
    InvalidValue(String),

    /// A codec or value error annotated with the operation that hit it.
    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<VindexError>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl VindexError {
    pub fn config(vindex: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            vindex: vindex.into(),
            message: message.into(),
        }
    }

    pub fn query(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Query {
            context: context.into(),
            source,
        }
    }

    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Prefixes an error with the operation that produced it.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result alias for vindex operations.
pub type Result<T> = std::result::Result<T, VindexError>;
