//! Daily statistics derived from cached hourly precipitation.

use crate::cache::table::{Observation, DATE_COLUMN, PLACE_COLUMN};
use chrono::{NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use log::warn;
use polars::prelude::*;
use std::collections::HashMap;

pub const DEFAULT_WET_HOUR_THRESHOLD_MM: f64 = 1.0;

pub const WET_HOURS_COLUMN: &str = "wet_hours_per_day";
pub const MAX_HOURLY_COLUMN: &str = "max_hourly_precip_mm";
pub const TOTAL_COLUMN: &str = "total_precip_mm";
pub const OBSERVED_HOURS_COLUMN: &str = "observed_hours";

/// Hourly precipitation summarized over one local calendar day.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WetHourStats {
    pub wet_hours: u32,
    pub max_hourly_mm: f64,
    pub total_mm: f64,
    pub observed_hours: u32,
}

/// Groups UTC hourly observations by the local date of `timezone`.
///
/// An hour is wet when its precipitation is at least `threshold_mm`. Unknown
/// timezones fall back to UTC.
pub fn daily_wet_hour_stats(
    hourly: &[Observation],
    timezone: &str,
    threshold_mm: f64,
) -> HashMap<NaiveDate, WetHourStats> {
    let tz: Tz = timezone.parse().unwrap_or_else(|_| {
        warn!("Unknown timezone '{}', grouping hours by UTC date", timezone);
        Tz::UTC
    });

    let mut stats: HashMap<NaiveDate, WetHourStats> = HashMap::new();
    for observation in hourly {
        let local_date = Utc
            .from_utc_datetime(&observation.timestamp)
            .with_timezone(&tz)
            .date_naive();
        let day = stats.entry(local_date).or_default();
        day.observed_hours += 1;
        day.total_mm += observation.value;
        if observation.value >= threshold_mm {
            day.wet_hours += 1;
        }
        if day.observed_hours == 1 || observation.value > day.max_hourly_mm {
            day.max_hourly_mm = observation.value;
        }
    }
    for day in stats.values_mut() {
        day.total_mm = round3(day.total_mm);
        day.max_hourly_mm = round3(day.max_hourly_mm);
    }
    stats
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

const ROW_INDEX_COLUMN: &str = "__row";

/// Left-joins wet-hour statistics onto a daily table by `(place_name, date)`.
///
/// Rows without statistics get zeros. Statistics for dates the daily table
/// lacks are dropped. Row order of `daily` is kept.
pub fn attach_wet_hour_stats(
    daily: &DataFrame,
    stats: &HashMap<(String, NaiveDate), WetHourStats>,
) -> PolarsResult<DataFrame> {
    if daily.height() == 0 {
        return Ok(daily.clone());
    }
    let rows: Vec<(&(String, NaiveDate), &WetHourStats)> = stats.iter().collect();
    let stats_frame = DataFrame::new(vec![
        Column::new(
            PLACE_COLUMN.into(),
            rows.iter().map(|((place, _), _)| place.as_str()).collect::<Vec<_>>(),
        ),
        DateChunked::from_naive_date(DATE_COLUMN.into(), rows.iter().map(|((_, date), _)| *date))
            .into_series()
            .into(),
        Column::new(
            WET_HOURS_COLUMN.into(),
            rows.iter().map(|(_, s)| s.wet_hours).collect::<Vec<u32>>(),
        ),
        Column::new(
            MAX_HOURLY_COLUMN.into(),
            rows.iter().map(|(_, s)| s.max_hourly_mm).collect::<Vec<f64>>(),
        ),
        Column::new(
            TOTAL_COLUMN.into(),
            rows.iter().map(|(_, s)| s.total_mm).collect::<Vec<f64>>(),
        ),
        Column::new(
            OBSERVED_HOURS_COLUMN.into(),
            rows.iter().map(|(_, s)| s.observed_hours).collect::<Vec<u32>>(),
        ),
    ])?;

    let mut output: Vec<Expr> = daily
        .get_column_names()
        .into_iter()
        .map(|name| col(name.clone()))
        .collect();
    output.extend([
        col(WET_HOURS_COLUMN).fill_null(lit(0u32)),
        col(MAX_HOURLY_COLUMN).fill_null(lit(0.0)),
        col(TOTAL_COLUMN).fill_null(lit(0.0)),
        col(OBSERVED_HOURS_COLUMN).fill_null(lit(0u32)),
    ]);
    let keys = [col(PLACE_COLUMN), col(DATE_COLUMN)];

    daily
        .clone()
        .lazy()
        .with_row_index(ROW_INDEX_COLUMN, None)
        .join(
            stats_frame.lazy(),
            keys.clone(),
            keys,
            JoinArgs::new(JoinType::Left),
        )
        .sort([ROW_INDEX_COLUMN], SortMultipleOptions::default())
        .select(output)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::table::observations_to_frame;
    use crate::types::location::PlaceRecord;
    use crate::types::measure::Measure;
    use chrono::NaiveDateTime;

    fn hour(raw: &str, value: f64) -> Observation {
        Observation {
            timestamp: NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M").unwrap(),
            value,
        }
    }

    #[test]
    fn groups_by_local_date() {
        let hourly = [
            hour("2024-01-01 22:00", 2.0),
            hour("2024-01-01 23:00", 0.5),
            hour("2024-01-02 00:00", 1.0),
        ];
        // UTC+1 in winter: only the 22:00 UTC hour stays on 1 January.
        let stats = daily_wet_hour_stats(&hourly, "Europe/Amsterdam", 1.0);
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let jan2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(
            stats[&jan1],
            WetHourStats {
                wet_hours: 1,
                max_hourly_mm: 2.0,
                total_mm: 2.0,
                observed_hours: 1
            }
        );
        assert_eq!(
            stats[&jan2],
            WetHourStats {
                wet_hours: 1,
                max_hourly_mm: 1.0,
                total_mm: 1.5,
                observed_hours: 2
            }
        );
    }

    #[test]
    fn unknown_timezone_uses_utc() {
        let stats = daily_wet_hour_stats(&[hour("2024-01-01 23:00", 0.2)], "Mars/Olympus", 1.0);
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(stats[&jan1].wet_hours, 0);
        assert_eq!(stats[&jan1].observed_hours, 1);
    }

    #[test]
    fn joins_and_zero_fills() -> Result<(), Box<dyn std::error::Error>> {
        let place = PlaceRecord {
            name: "Testville".to_string(),
            lat: 0.0,
            lon: 0.0,
            timezone: "UTC".to_string(),
            grid_lat: 0.0,
            grid_lon: 0.0,
        };
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1).ok_or("date")?;
        let jan2 = NaiveDate::from_ymd_opt(2024, 1, 2).ok_or("date")?;
        let daily = observations_to_frame(
            Measure::DailyPrecipitation,
            "precip_mm",
            &place,
            &[Observation::daily(jan1, 3.0), Observation::daily(jan2, 0.0)],
        )?;
        let jan3 = NaiveDate::from_ymd_opt(2024, 1, 3).ok_or("date")?;
        let day_stats = WetHourStats {
            wet_hours: 2,
            max_hourly_mm: 1.5,
            total_mm: 3.0,
            observed_hours: 24,
        };
        let stats = HashMap::from([
            (("Testville".to_string(), jan1), day_stats),
            (("Testville".to_string(), jan3), day_stats),
            (("Elsewhere".to_string(), jan2), day_stats),
        ]);
        let joined = attach_wet_hour_stats(&daily, &stats)?;
        let wet: Vec<Option<u32>> = joined
            .column(WET_HOURS_COLUMN)?
            .as_materialized_series()
            .u32()?
            .into_iter()
            .collect();
        assert_eq!(wet, vec![Some(2), Some(0)]);
        let totals: Vec<Option<f64>> = joined
            .column(TOTAL_COLUMN)?
            .as_materialized_series()
            .f64()?
            .into_iter()
            .collect();
        assert_eq!(totals, vec![Some(3.0), Some(0.0)]);
        assert_eq!(joined.height(), 2);
        assert_eq!(joined.width(), daily.width() + 4);
        Ok(())
    }
}
