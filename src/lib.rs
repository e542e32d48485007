mod climate_cache;
mod config;
mod error;
mod measures;
mod retrieval;
mod schema;
mod types;
mod utils;

pub mod cache;

pub use climate_cache::*;
pub use config::{ConfigError, RetrievalSettings, Settings};
pub use error::ClimateCacheError;

pub use cache::error::{CacheError, SummaryError, VersionRejection};
pub use cache::store::{cache_file_name, CacheStore};
pub use cache::summary::{compress_years, country_from_place_name, expand_year_ranges};

pub use measures::error::{MeasureError, UnsupportedMeasureError};
pub use measures::registry::MeasureRegistry;
pub use schema::error::SchemaError;
pub use schema::registry::SchemaRegistry;

pub use retrieval::aggregates::{
    WetHourStats, DEFAULT_WET_HOUR_THRESHOLD_MM, MAX_HOURLY_COLUMN, OBSERVED_HOURS_COLUMN,
    TOTAL_COLUMN, WET_HOURS_COLUMN,
};
pub use retrieval::coordinator::{
    format_retrieval_summary, PlaceFailure, PlacePlan, RetrievalCoordinator, RetrievalOutput,
};
pub use retrieval::error::RetrievalError;
pub use retrieval::fetcher::{Chunking, FetchError, FetchOptions, Fetcher};
pub use retrieval::progress::{LogProgress, ProgressError, ProgressObserver, Stage};

pub use types::location::{Location, PlaceRecord};
pub use types::measure::Measure;
pub use types::variable::VariableMetadata;
