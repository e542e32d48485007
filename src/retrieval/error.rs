use crate::cache::error::CacheError;
use crate::retrieval::fetcher::FetchError;
use crate::types::measure::Measure;
use polars::error::PolarsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Fetching {measure} for '{place}' ({year_start}-{year_end}) failed")]
    Fetch {
        place: String,
        measure: Measure,
        year_start: i32,
        year_end: i32,
        #[source]
        source: FetchError,
    },

    #[error("Invalid year range {start}-{end}: start is after end")]
    InvalidYearRange { start: i32, end: i32 },

    #[error("Failed processing DataFrame: {0}")]
    DataFrameProcessing(#[from] PolarsError),
}
