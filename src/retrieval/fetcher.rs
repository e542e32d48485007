//! The remote data source as seen by the coordinator.

use crate::types::location::Location;
use crate::types::measure::Measure;
use async_trait::async_trait;
use chrono::NaiveDate;
use polars::prelude::DataFrame;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Error type returned by [`Fetcher`] implementations.
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

pub const DEFAULT_MONTH_FETCH_DAY_SPAN_THRESHOLD: u32 = 62;

/// How a fetcher should split a request into remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chunking {
    #[default]
    Monthly,
    Yearly,
    /// Monthly for short spans, yearly otherwise.
    Auto,
}

impl fmt::Display for Chunking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Chunking::Monthly => "monthly",
            Chunking::Yearly => "yearly",
            Chunking::Auto => "auto",
        };
        f.write_str(name)
    }
}

impl FromStr for Chunking {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "monthly" => Ok(Chunking::Monthly),
            "yearly" => Ok(Chunking::Yearly),
            "auto" => Ok(Chunking::Auto),
            other => Err(format!(
                "invalid fetch mode '{other}'. Allowed: auto, monthly, yearly"
            )),
        }
    }
}

/// Per-call options handed to the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub chunking: Chunking,
    pub month_fetch_day_span_threshold: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            chunking: Chunking::default(),
            month_fetch_day_span_threshold: DEFAULT_MONTH_FETCH_DAY_SPAN_THRESHOLD,
        }
    }
}

impl FetchOptions {
    /// Resolves [`Chunking::Auto`] for the calendar years `year_start..=year_end`.
    ///
    /// ```
    /// use climate_cache::{Chunking, FetchOptions};
    ///
    /// let options = FetchOptions { chunking: Chunking::Auto, month_fetch_day_span_threshold: 62 };
    /// assert_eq!(options.resolved_chunking(2020, 2020), Chunking::Yearly);
    /// ```
    pub fn resolved_chunking(&self, year_start: i32, year_end: i32) -> Chunking {
        match self.chunking {
            Chunking::Auto => {
                if day_span(year_start, year_end) <= i64::from(self.month_fetch_day_span_threshold) {
                    Chunking::Monthly
                } else {
                    Chunking::Yearly
                }
            }
            fixed => fixed,
        }
    }
}

/// Number of days from 1 January of `year_start` through 31 December of `year_end`.
fn day_span(year_start: i32, year_end: i32) -> i64 {
    let start = NaiveDate::from_ymd_opt(year_start, 1, 1);
    let end = NaiveDate::from_ymd_opt(year_end, 12, 31);
    match (start, end) {
        (Some(start), Some(end)) if end >= start => (end - start).num_days() + 1,
        _ => 0,
    }
}

/// Retrieves observations from the remote source.
///
/// Implementations return one row per observation (per day, or per UTC hour for
/// hourly measures) with at least the columns `date`, the measure's value
/// column, `place_name`, `grid_lat` and `grid_lon`. Retries and timeouts are
/// the implementation's concern.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        location: &Location,
        measure: Measure,
        year_start: i32,
        year_end: i32,
        options: &FetchOptions,
    ) -> Result<DataFrame, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_chunking_depends_on_day_span() {
        let options = FetchOptions {
            chunking: Chunking::Auto,
            month_fetch_day_span_threshold: 400,
        };
        assert_eq!(options.resolved_chunking(2020, 2020), Chunking::Monthly);
        assert_eq!(options.resolved_chunking(2020, 2021), Chunking::Yearly);

        let fixed = FetchOptions {
            chunking: Chunking::Monthly,
            month_fetch_day_span_threshold: 1,
        };
        assert_eq!(fixed.resolved_chunking(2000, 2020), Chunking::Monthly);
    }

    #[test]
    fn day_span_counts_leap_years() {
        assert_eq!(day_span(2020, 2020), 366);
        assert_eq!(day_span(2021, 2022), 730);
        assert_eq!(day_span(2022, 2021), 0);
    }

    #[test]
    fn parses_fetch_modes() {
        assert_eq!("Yearly".parse::<Chunking>(), Ok(Chunking::Yearly));
        assert!("weekly".parse::<Chunking>().is_err());
    }
}
