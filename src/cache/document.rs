//! In-memory form of one place's cache file.
//!
//! Values are stored as `Year -> Month -> Day[-> Hour] -> f64`. All keys are
//! integers here; string keys found on disk are normalized on read.

use crate::types::location::PlaceRecord;
use crate::types::variable::VariableMetadata;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};

pub type HourMap = BTreeMap<u32, f64>;
pub type DayMap = BTreeMap<u32, DayValue>;
pub type MonthMap = BTreeMap<u32, DayMap>;
pub type ValueMap = BTreeMap<i32, MonthMap>;

/// The Day level holds a value for daily variables and an hour map for hourly ones.
#[derive(Debug, Clone, PartialEq)]
pub enum DayValue {
    Value(f64),
    Hours(HourMap),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheDocument {
    pub schema_version: u32,
    pub place: PlaceRecord,
    /// Metadata per cache variable, in encounter order.
    pub variables: Vec<(String, VariableMetadata)>,
    /// Value maps per cache variable, in encounter order.
    pub data: Vec<(String, ValueMap)>,
}

impl CacheDocument {
    pub fn new(schema_version: u32, place: PlaceRecord) -> Self {
        Self {
            schema_version,
            place,
            variables: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn data_for(&self, cache_variable: &str) -> Option<&ValueMap> {
        self.data
            .iter()
            .find(|(name, _)| name == cache_variable)
            .map(|(_, values)| values)
    }

    /// Value map for `cache_variable`, appended empty when absent.
    pub fn data_entry(&mut self, cache_variable: &str) -> &mut ValueMap {
        let index = match self.data.iter().position(|(name, _)| name == cache_variable) {
            Some(index) => index,
            None => {
                self.data.push((cache_variable.to_string(), ValueMap::new()));
                self.data.len() - 1
            }
        };
        &mut self.data[index].1
    }

    pub fn metadata_for(&self, cache_variable: &str) -> Option<&VariableMetadata> {
        self.variables
            .iter()
            .find(|(name, _)| name == cache_variable)
            .map(|(_, metadata)| metadata)
    }

    /// Adds metadata for `cache_variable` unless some is already recorded.
    pub fn ensure_metadata(&mut self, cache_variable: &str, metadata: VariableMetadata) -> bool {
        if self.metadata_for(cache_variable).is_some() {
            return false;
        }
        self.variables.push((cache_variable.to_string(), metadata));
        true
    }

    /// Years holding at least one value for `cache_variable`.
    pub fn years_for(&self, cache_variable: &str) -> BTreeSet<i32> {
        self.data_for(cache_variable)
            .map(|values| {
                values
                    .iter()
                    .filter(|(_, months)| has_values(months))
                    .map(|(year, _)| *year)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn has_values(months: &MonthMap) -> bool {
    months.values().any(|days| {
        days.values().any(|day| match day {
            DayValue::Value(_) => true,
            DayValue::Hours(hours) => !hours.is_empty(),
        })
    })
}

/// Merges `incoming` into `target` key by key.
///
/// A leaf is written iff `overwrite` is set or the key is absent in `target`.
pub fn merge_values(target: &mut ValueMap, incoming: ValueMap, overwrite: bool) {
    for (year, months) in incoming {
        let target_months = target.entry(year).or_default();
        for (month, days) in months {
            let target_days = target_months.entry(month).or_default();
            for (day, value) in days {
                match (target_days.get_mut(&day), value) {
                    (None, value) => {
                        target_days.insert(day, value);
                    }
                    (Some(DayValue::Hours(existing)), DayValue::Hours(hours)) => {
                        for (hour, v) in hours {
                            if overwrite || !existing.contains_key(&hour) {
                                existing.insert(hour, v);
                            }
                        }
                    }
                    (Some(existing), value) => {
                        if overwrite {
                            *existing = value;
                        }
                    }
                }
            }
        }
    }
}

/// Parses an integer key that may have been written as a string.
pub(crate) fn int_key(key: &Value) -> Option<i64> {
    match key {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn float_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn key_in_range<T: TryFrom<i64>>(key: &Value, what: &str) -> Result<T, String> {
    int_key(key)
        .and_then(|k| T::try_from(k).ok())
        .ok_or_else(|| format!("invalid {what} key {}", describe(key)))
}

fn describe(value: &Value) -> String {
    serde_yaml::to_string(value)
        .map(|s| s.trim_end().to_string())
        .unwrap_or_else(|_| format!("{value:?}"))
}

/// Converts a parsed YAML value map into a [`ValueMap`], normalizing keys.
///
/// Null leaves are dropped, and so are containers left empty.
pub(crate) fn value_map_from_yaml(value: &Value) -> Result<ValueMap, String> {
    let years = value
        .as_mapping()
        .ok_or_else(|| "value map is not a mapping".to_string())?;
    let mut out = ValueMap::new();
    for (year_key, months_value) in years {
        let year: i32 = key_in_range(year_key, "year")?;
        let Some(months_mapping) = months_value.as_mapping() else {
            if months_value.is_null() {
                continue;
            }
            return Err(format!("year {year} does not hold a month mapping"));
        };
        let mut months = MonthMap::new();
        for (month_key, days_value) in months_mapping {
            let month: u32 = key_in_range(month_key, "month")?;
            let Some(days_mapping) = days_value.as_mapping() else {
                if days_value.is_null() {
                    continue;
                }
                return Err(format!("{year}-{month} does not hold a day mapping"));
            };
            let mut days = DayMap::new();
            for (day_key, day_value) in days_mapping {
                let day: u32 = key_in_range(day_key, "day")?;
                match day_value {
                    Value::Null => {}
                    Value::Mapping(hours_mapping) => {
                        let mut hours = HourMap::new();
                        for (hour_key, hour_value) in hours_mapping {
                            let hour: u32 = key_in_range(hour_key, "hour")?;
                            if hour_value.is_null() {
                                continue;
                            }
                            let v = float_value(hour_value).ok_or_else(|| {
                                format!("non-numeric value at {year}-{month}-{day} hour {hour}")
                            })?;
                            hours.insert(hour, v);
                        }
                        if !hours.is_empty() {
                            days.insert(day, DayValue::Hours(hours));
                        }
                    }
                    other => {
                        let v = float_value(other)
                            .ok_or_else(|| format!("non-numeric value at {year}-{month}-{day}"))?;
                        days.insert(day, DayValue::Value(v));
                    }
                }
            }
            if !days.is_empty() {
                months.entry(month).or_insert_with(DayMap::new).extend(days);
            }
        }
        if !months.is_empty() {
            let target = out.entry(year).or_default();
            for (month, days) in months {
                target.entry(month).or_default().extend(days);
            }
        }
    }
    Ok(out)
}

/// Resolves a dot-separated path against a YAML tree.
pub(crate) fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |node, segment| node.as_mapping()?.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place() -> PlaceRecord {
        PlaceRecord {
            name: "Testville".to_string(),
            lat: 1.0,
            lon: 2.0,
            timezone: "UTC".to_string(),
            grid_lat: 1.0,
            grid_lon: 2.0,
        }
    }

    fn daily(entries: &[(i32, u32, u32, f64)]) -> ValueMap {
        let mut values = ValueMap::new();
        for (y, m, d, v) in entries {
            values
                .entry(*y)
                .or_default()
                .entry(*m)
                .or_default()
                .insert(*d, DayValue::Value(*v));
        }
        values
    }

    #[test]
    fn normalizes_string_and_integer_keys() {
        let yaml: Value = serde_yaml::from_str(
            r#"
"2020":
  1:
    "1": 3.5
    2: "4.25"
2021:
  "12":
    31: ~
"#,
        )
        .unwrap();
        let values = value_map_from_yaml(&yaml).unwrap();
        assert_eq!(values, daily(&[(2020, 1, 1, 3.5), (2020, 1, 2, 4.25)]));
    }

    #[test]
    fn hourly_day_level_nests_hours() {
        let yaml: Value = serde_yaml::from_str("2020: {1: {1: {0: 0.1, '23': 0.0}}}").unwrap();
        let values = value_map_from_yaml(&yaml).unwrap();
        let day = &values[&2020][&1][&1];
        assert_eq!(
            day,
            &DayValue::Hours(BTreeMap::from([(0, 0.1), (23, 0.0)]))
        );
    }

    #[test]
    fn rejects_non_numeric_leaves_and_bad_keys() {
        let yaml: Value = serde_yaml::from_str("2020: {1: {1: warm}}").unwrap();
        assert!(value_map_from_yaml(&yaml).is_err());
        let yaml: Value = serde_yaml::from_str("year: {1: {1: 1.0}}").unwrap();
        assert!(value_map_from_yaml(&yaml).is_err());
    }

    #[test]
    fn merge_keeps_existing_values_unless_overwriting() {
        let mut target = daily(&[(2020, 1, 1, 1.0)]);
        merge_values(&mut target, daily(&[(2020, 1, 1, 9.0), (2020, 1, 2, 2.0)]), false);
        assert_eq!(target, daily(&[(2020, 1, 1, 1.0), (2020, 1, 2, 2.0)]));

        merge_values(&mut target, daily(&[(2020, 1, 1, 9.0)]), true);
        assert_eq!(target, daily(&[(2020, 1, 1, 9.0), (2020, 1, 2, 2.0)]));
    }

    #[test]
    fn merge_combines_hour_maps() {
        let mut target = ValueMap::new();
        target.entry(2020).or_default().entry(1).or_default().insert(
            1,
            DayValue::Hours(BTreeMap::from([(0, 0.5)])),
        );
        let mut incoming = ValueMap::new();
        incoming.entry(2020).or_default().entry(1).or_default().insert(
            1,
            DayValue::Hours(BTreeMap::from([(0, 9.9), (1, 0.2)])),
        );
        merge_values(&mut target, incoming, false);
        assert_eq!(
            target[&2020][&1][&1],
            DayValue::Hours(BTreeMap::from([(0, 0.5), (1, 0.2)]))
        );
    }

    #[test]
    fn tracks_metadata_and_years() {
        let mut document = CacheDocument::new(2, place());
        *document.data_entry("noon_temp_C") = daily(&[(2019, 5, 1, 10.0), (2021, 5, 1, 11.0)]);
        assert!(document.ensure_metadata("noon_temp_C", VariableMetadata::default()));
        assert!(!document.ensure_metadata("noon_temp_C", VariableMetadata::default()));
        assert_eq!(
            document.years_for("noon_temp_C"),
            BTreeSet::from([2019, 2021])
        );
        assert!(document.years_for("daily_precip_mm").is_empty());
    }

    #[test]
    fn looks_up_dotted_paths() {
        let yaml: Value = serde_yaml::from_str("place: {name: Testville}\n").unwrap();
        assert_eq!(
            lookup_path(&yaml, "place.name").and_then(Value::as_str),
            Some("Testville")
        );
        assert!(lookup_path(&yaml, "place.lat").is_none());
    }
}
