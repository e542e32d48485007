use crate::cache::error::{CacheError, SummaryError};
use crate::config::ConfigError;
use crate::measures::error::{MeasureError, UnsupportedMeasureError};
use crate::retrieval::error::RetrievalError;
use crate::schema::error::SchemaError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClimateCacheError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Measure(#[from] MeasureError),

    #[error(transparent)]
    UnsupportedMeasure(#[from] UnsupportedMeasureError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Summary(#[from] SummaryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("Failed to create cache directory '{0}'")]
    CacheDirCreation(PathBuf, #[source] std::io::Error),

    #[error("Failed to determine cache directory")]
    CacheDirResolution(#[source] std::io::Error),
}
