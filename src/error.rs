//! Error taxonomy for the graph engine.
//!
//! Library seams return [`TrailError`] so callers can tell a recoverable
//! source outage from a fatal store problem. The CLI converts everything
//! into `anyhow::Error` at the edge.

use thiserror::Error;

pub type Result<T, E = TrailError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TrailError {
    /// A plugin could not reach its source (network, auth, missing repo).
    /// Captured per plugin in the build summary; never aborts a build.
    #[error("source '{plugin}' unavailable: {message}")]
    SourceUnavailable { plugin: String, message: String },

    /// The store file is missing, corrupt, or locked by another build.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A write inside the build transaction failed; everything was rolled back.
    #[error("transaction failed: {0}")]
    TransactionFailure(String),

    /// An unparseable metadata/properties/cursor blob. Only ever logged.
    #[error("malformed {what}: {message}")]
    MalformedRecord { what: String, message: String },

    #[error("schema version mismatch: store is {store}, engine is {engine}")]
    SchemaVersionMismatch { store: String, engine: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TrailError {
    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        TrailError::StoreUnavailable(err.to_string())
    }

    pub(crate) fn transaction(err: impl std::fmt::Display) -> Self {
        TrailError::TransactionFailure(err.to_string())
    }

    pub(crate) fn malformed(what: &str, err: impl std::fmt::Display) -> Self {
        TrailError::MalformedRecord {
            what: what.to_string(),
            message: err.to_string(),
        }
    }

    /// Stable machine-readable code, used by the HTTP surface and summaries.
    pub fn code(&self) -> &'static str {
        match self {
            TrailError::SourceUnavailable { .. } => "source_unavailable",
            TrailError::StoreUnavailable(_) => "store_unavailable",
            TrailError::TransactionFailure(_) => "transaction_failure",
            TrailError::MalformedRecord { .. } => "malformed_record",
            TrailError::SchemaVersionMismatch { .. } => "schema_version_mismatch",
            TrailError::Config(_) => "config",
        }
    }
}
