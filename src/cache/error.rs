use crate::measures::error::MeasureError;
use polars::error::PolarsError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Why a document's `schema_version` was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRejection {
    Missing,
    Invalid(String),
    Newer { found: u32, supported: u32 },
    Unknown(u32),
}

impl fmt::Display for VersionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRejection::Missing => write!(f, "document has no schema_version"),
            VersionRejection::Invalid(raw) => write!(f, "schema_version '{raw}' is not an integer"),
            VersionRejection::Newer { found, supported } => write!(
                f,
                "schema_version {found} is newer than the supported version {supported}"
            ),
            VersionRejection::Unknown(found) => {
                write!(f, "schema_version {found} is not declared in the schema registry")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Unsupported schema version in '{path}': {reason}")]
    UnsupportedSchemaVersion {
        path: PathBuf,
        reason: VersionRejection,
    },

    #[error("Failed to migrate cache file '{path}': {message}")]
    Migration { path: PathBuf, message: String },

    #[error("Malformed cache file '{path}': {message}")]
    MalformedDocument { path: PathBuf, message: String },

    #[error("Failed to parse cache file '{0}'")]
    Parse(PathBuf, #[source] serde_yaml::Error),

    #[error("Input table for '{measure}' is missing column '{column}'")]
    MissingColumn { measure: String, column: String },

    #[error("Invalid value in column '{column}': {message}")]
    InvalidTable { column: String, message: String },

    #[error("Failed to read cache file '{0}'")]
    CacheRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to write cache file '{0}'")]
    CacheWrite(PathBuf, #[source] std::io::Error),

    #[error("Failed to read metadata for cache file '{0}'")]
    CacheMetadataRead(PathBuf, #[source] std::io::Error),

    #[error(transparent)]
    Summary(#[from] SummaryError),

    #[error(transparent)]
    Measure(#[from] MeasureError),

    #[error("Failed processing DataFrame: {0}")]
    DataFrameProcessing(#[from] PolarsError),

    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl CacheError {
    /// Errors that mean the file exists but must not be touched.
    pub fn is_schema_rejection(&self) -> bool {
        matches!(
            self,
            CacheError::UnsupportedSchemaVersion { .. } | CacheError::Migration { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("Failed to read summary index '{0}'")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("Failed to write summary index '{0}'")]
    Write(PathBuf, #[source] std::io::Error),

    #[error("Failed to decode summary index '{0}'")]
    Decode(PathBuf, #[source] serde_json::Error),

    #[error("Failed to encode summary index")]
    Encode(#[source] serde_json::Error),

    #[error("Invalid year range token '{0}'")]
    InvalidRange(String),

    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}
