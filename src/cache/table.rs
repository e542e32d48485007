//! Conversion between polars tables and flat observation rows.
//!
//! Every table the crate produces goes through [`observations_to_frame`], so
//! frames for the same measure always share one schema and can be concatenated.

use crate::cache::error::CacheError;
use crate::types::location::PlaceRecord;
use crate::types::measure::Measure;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use polars::prelude::*;

pub const DATE_COLUMN: &str = "date";
pub const PLACE_COLUMN: &str = "place_name";
pub const GRID_LAT_COLUMN: &str = "grid_lat";
pub const GRID_LON_COLUMN: &str = "grid_lon";
pub const FAHRENHEIT_COLUMN: &str = "temp_F";

/// One value at one point in time. Daily rows use midnight; hourly rows hold UTC.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

impl Observation {
    pub fn daily(date: NaiveDate, value: f64) -> Self {
        Self {
            timestamp: date.and_time(NaiveTime::MIN),
            value,
        }
    }
}

/// Builds the canonical table for `measure`.
///
/// Columns: `date`, the value column, `temp_F` for noon temperature, then
/// `place_name`, `grid_lat`, `grid_lon`. Hourly measures carry a millisecond
/// `Datetime` in UTC, daily ones a `Date`.
pub fn observations_to_frame(
    measure: Measure,
    value_column: &str,
    place: &PlaceRecord,
    rows: &[Observation],
) -> PolarsResult<DataFrame> {
    let date_column: Column = if measure.is_hourly() {
        DatetimeChunked::from_naive_datetime(
            DATE_COLUMN.into(),
            rows.iter().map(|row| row.timestamp),
            TimeUnit::Milliseconds,
        )
        .into_series()
        .into()
    } else {
        DateChunked::from_naive_date(DATE_COLUMN.into(), rows.iter().map(|row| row.timestamp.date()))
            .into_series()
            .into()
    };

    let values: Vec<f64> = rows.iter().map(|row| row.value).collect();
    let mut columns = vec![date_column, Column::new(value_column.into(), values.clone())];
    if measure == Measure::NoonTemperature {
        let fahrenheit: Vec<f64> = values.iter().map(|c| celsius_to_fahrenheit(*c)).collect();
        columns.push(Column::new(FAHRENHEIT_COLUMN.into(), fahrenheit));
    }
    columns.push(Column::new(
        PLACE_COLUMN.into(),
        vec![place.name.as_str(); rows.len()],
    ));
    columns.push(Column::new(GRID_LAT_COLUMN.into(), vec![place.grid_lat; rows.len()]));
    columns.push(Column::new(GRID_LON_COLUMN.into(), vec![place.grid_lon; rows.len()]));
    DataFrame::new(columns)
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    ((celsius * 9.0 / 5.0 + 32.0) * 100.0).round() / 100.0
}

/// Reads `date` and `value_column` from an input table.
///
/// Rows with a null date, a null value, or a NaN value are skipped. Dates may be
/// typed as `Date`, `Datetime`, or ISO-8601 strings.
pub fn frame_to_observations(
    table: &DataFrame,
    measure: Measure,
    value_column: &str,
) -> Result<Vec<Observation>, CacheError> {
    let missing = |column: &str| CacheError::MissingColumn {
        measure: measure.name().to_string(),
        column: column.to_string(),
    };
    let dates = table
        .column(DATE_COLUMN)
        .map_err(|_| missing(DATE_COLUMN))?
        .as_materialized_series()
        .cast(&DataType::String)?;
    let values = table
        .column(value_column)
        .map_err(|_| missing(value_column))?
        .as_materialized_series()
        .cast(&DataType::Float64)?;

    let mut rows = Vec::with_capacity(table.height());
    for (date, value) in dates.str()?.into_iter().zip(values.f64()?.into_iter()) {
        let (Some(date), Some(value)) = (date, value) else {
            continue;
        };
        if value.is_nan() {
            continue;
        }
        let timestamp = parse_timestamp(date).ok_or_else(|| CacheError::InvalidTable {
            column: DATE_COLUMN.to_string(),
            message: format!("cannot parse '{date}' as a date"),
        })?;
        let timestamp = if measure.is_hourly() {
            timestamp
        } else {
            timestamp.date().and_time(NaiveTime::MIN)
        };
        rows.push(Observation { timestamp, value });
    }
    Ok(rows)
}

/// First non-null `(grid_lat, grid_lon)` pair of a table, if it has both columns.
pub fn grid_point(table: &DataFrame) -> Option<(f64, f64)> {
    let column = |name: &str| -> Option<Series> {
        table
            .column(name)
            .ok()?
            .as_materialized_series()
            .cast(&DataType::Float64)
            .ok()
    };
    let lat = column(GRID_LAT_COLUMN)?;
    let lon = column(GRID_LON_COLUMN)?;
    let lat = lat.f64().ok()?;
    let lon = lon.f64().ok()?;
    let found = lat
        .into_iter()
        .zip(lon.into_iter())
        .find_map(|(lat, lon)| Some((lat?, lon?)));
    found
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_utc());
    }
    let naive = raw.strip_suffix(" UTC").unwrap_or(raw);
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN))
}

/// Concatenates tables vertically; no tables yield an empty frame.
pub fn concat_frames(frames: Vec<DataFrame>) -> PolarsResult<DataFrame> {
    let frames: Vec<LazyFrame> = frames
        .into_iter()
        .filter(|frame| frame.height() > 0)
        .map(IntoLazy::lazy)
        .collect();
    if frames.is_empty() {
        return Ok(DataFrame::empty());
    }
    concat(frames, UnionArgs::default())?.collect()
}
