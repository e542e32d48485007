//! Settings file support.
//!
//! ```yaml
//! paths:
//!   data_cache_dir: ~/data/climate
//! retrieval:
//!   wet_hour_threshold_mm: 1.0
//!   month_fetch_day_span_threshold: 62
//!   fetch_mode:
//!     noon_temperature: auto
//!     precipitation: monthly
//! ```

use crate::retrieval::aggregates::DEFAULT_WET_HOUR_THRESHOLD_MM;
use crate::retrieval::fetcher::{Chunking, FetchOptions, DEFAULT_MONTH_FETCH_DAY_SPAN_THRESHOLD};
use crate::types::measure::Measure;
use crate::utils::get_cache_dir;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings file '{0}'")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse settings from {origin}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid setting '{key}': {message}")]
    Invalid { key: String, message: String },

    #[error("Failed to determine cache directory")]
    CacheDirResolution(#[source] std::io::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    paths: RawPaths,
    retrieval: RawRetrieval,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPaths {
    data_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRetrieval {
    wet_hour_threshold_mm: Option<f64>,
    month_fetch_day_span_threshold: Option<i64>,
    fetch_mode: BTreeMap<String, String>,
}

/// Tunables of the retrieval coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalSettings {
    /// Hours with at least this much precipitation count as wet.
    pub wet_hour_threshold_mm: f64,
    /// `Chunking::Auto` fetches monthly up to this many days.
    pub month_fetch_day_span_threshold: u32,
    fetch_modes: HashMap<Measure, Chunking>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            wet_hour_threshold_mm: DEFAULT_WET_HOUR_THRESHOLD_MM,
            month_fetch_day_span_threshold: DEFAULT_MONTH_FETCH_DAY_SPAN_THRESHOLD,
            fetch_modes: HashMap::new(),
        }
    }
}

impl RetrievalSettings {
    pub fn chunking_for(&self, measure: Measure) -> Chunking {
        self.fetch_modes
            .get(&measure)
            .copied()
            .unwrap_or(match measure {
                Measure::NoonTemperature => Chunking::Auto,
                _ => Chunking::Monthly,
            })
    }

    pub fn set_chunking(&mut self, measure: Measure, chunking: Chunking) {
        self.fetch_modes.insert(measure, chunking);
    }

    pub fn fetch_options(&self, measure: Measure) -> FetchOptions {
        FetchOptions {
            chunking: self.chunking_for(measure),
            month_fetch_day_span_threshold: self.month_fetch_day_span_threshold,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    /// Overrides the platform cache directory.
    pub data_cache_dir: Option<PathBuf>,
    pub retrieval: RetrievalSettings,
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, "<string>")
    }

    fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        // An empty file is a valid, all-defaults configuration.
        let raw: RawSettings = if text.trim().is_empty() {
            RawSettings::default()
        } else {
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
                origin: origin.to_string(),
                source: e,
            })?
        };

        let mut retrieval = RetrievalSettings::default();
        if let Some(threshold) = raw.retrieval.wet_hour_threshold_mm {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(invalid(
                    "retrieval.wet_hour_threshold_mm",
                    format!("must be a number >= 0, got {threshold}"),
                ));
            }
            retrieval.wet_hour_threshold_mm = threshold;
        }
        if let Some(span) = raw.retrieval.month_fetch_day_span_threshold {
            retrieval.month_fetch_day_span_threshold = u32::try_from(span)
                .ok()
                .filter(|span| *span > 0)
                .ok_or_else(|| {
                    invalid(
                        "retrieval.month_fetch_day_span_threshold",
                        format!("must be a positive integer, got {span}"),
                    )
                })?;
        }
        for (name, mode) in &raw.retrieval.fetch_mode {
            let key = format!("retrieval.fetch_mode.{name}");
            let measure: Measure = name
                .parse()
                .map_err(|e: crate::UnsupportedMeasureError| invalid(&key, e.to_string()))?;
            let chunking: Chunking = mode.parse().map_err(|e: String| invalid(&key, e))?;
            retrieval.set_chunking(measure, chunking);
        }

        Ok(Self {
            data_cache_dir: raw.paths.data_cache_dir,
            retrieval,
        })
    }

    /// The configured cache directory, or the platform default.
    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => get_cache_dir().map_err(ConfigError::CacheDirResolution),
        }
    }
}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_settings() {
        let settings = Settings::from_yaml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.retrieval.wet_hour_threshold_mm, 1.0);
        assert_eq!(settings.retrieval.month_fetch_day_span_threshold, 62);
        assert_eq!(
            settings.retrieval.chunking_for(Measure::NoonTemperature),
            Chunking::Auto
        );
        assert_eq!(
            settings.retrieval.chunking_for(Measure::DailySolarRadiationEnergy),
            Chunking::Monthly
        );
    }

    #[test]
    fn reads_paths_and_fetch_modes_with_aliases() {
        let settings = Settings::from_yaml_str(
            r#"
paths:
  data_cache_dir: /tmp/climate
retrieval:
  wet_hour_threshold_mm: 0.5
  month_fetch_day_span_threshold: 31
  fetch_mode:
    temp: yearly
    precipitation: auto
"#,
        )
        .unwrap();
        assert_eq!(settings.cache_dir().unwrap(), PathBuf::from("/tmp/climate"));
        let options = settings.retrieval.fetch_options(Measure::NoonTemperature);
        assert_eq!(options.chunking, Chunking::Yearly);
        assert_eq!(options.month_fetch_day_span_threshold, 31);
        assert_eq!(
            settings.retrieval.chunking_for(Measure::DailyPrecipitation),
            Chunking::Auto
        );
        assert_eq!(settings.retrieval.wet_hour_threshold_mm, 0.5);
    }

    #[test]
    fn rejects_invalid_values() {
        for yaml in [
            "retrieval: {wet_hour_threshold_mm: -1}",
            "retrieval: {month_fetch_day_span_threshold: 0}",
            "retrieval: {fetch_mode: {snowfall: auto}}",
            "retrieval: {fetch_mode: {temp: weekly}}",
        ] {
            let err = Settings::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{yaml}: {err}");
        }
        assert!(matches!(
            Settings::from_yaml_str("retrieval: 5"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
