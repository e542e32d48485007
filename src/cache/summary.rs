//! Per-directory index of cached year ranges.
//!
//! The index answers "which years are cached for this file and measure" without
//! parsing the cache document. It is stored as JSON next to the cache files.

use crate::cache::document::CacheDocument;
use crate::cache::error::SummaryError;
use crate::measures::registry::MeasureRegistry;
use crate::types::measure::Measure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::{fs, task};

pub const SUMMARY_FILE_NAME: &str = "cache_summary.json";
pub const SUMMARY_VERSION: u32 = 1;

const US_STATE_CODES: [&str; 51] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC",
];

/// A range token: `"2020"`, `"2020-2022"`, or a bare year from older indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YearToken {
    Year(i32),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureCoverage {
    #[serde(default, alias = "years")]
    pub year_ranges: Vec<YearToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub place_name: String,
    #[serde(default)]
    pub country: String,
    /// Keyed by measure name.
    #[serde(default)]
    pub measures: BTreeMap<String, MeasureCoverage>,
}

impl SummaryEntry {
    /// Computes the entry from document content.
    pub fn from_document(document: &CacheDocument, measures: &MeasureRegistry) -> Self {
        let coverage = Measure::ALL
            .iter()
            .filter_map(|measure| {
                let years = document.years_for(measures.cache_variable(*measure));
                (!years.is_empty()).then(|| {
                    let tokens = compress_years(years)
                        .into_iter()
                        .map(YearToken::Text)
                        .collect();
                    (
                        measure.name().to_string(),
                        MeasureCoverage {
                            year_ranges: tokens,
                        },
                    )
                })
            })
            .collect();
        Self {
            place_name: document.place.name.clone(),
            country: country_from_place_name(&document.place.name),
            measures: coverage,
        }
    }

    /// Years recorded for `measure`; an absent measure has no years.
    pub fn years_for(&self, measure: Measure) -> Result<BTreeSet<i32>, SummaryError> {
        match self.measures.get(measure.name()) {
            Some(coverage) => expand_year_ranges(&coverage.year_ranges),
            None => Ok(BTreeSet::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryIndex {
    pub summary_version: u32,
    pub updated_at: DateTime<Utc>,
    /// Keyed by cache file name.
    #[serde(default)]
    pub files: BTreeMap<String, SummaryEntry>,
}

impl Default for SummaryIndex {
    fn default() -> Self {
        Self {
            summary_version: SUMMARY_VERSION,
            updated_at: Utc::now(),
            files: BTreeMap::new(),
        }
    }
}

impl SummaryIndex {
    pub fn path_in(cache_dir: &Path) -> PathBuf {
        cache_dir.join(SUMMARY_FILE_NAME)
    }

    /// Reads the index of `cache_dir`. `Ok(None)` means no index file exists yet.
    pub async fn load(cache_dir: &Path) -> Result<Option<Self>, SummaryError> {
        let path = Self::path_in(cache_dir);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SummaryError::Read(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SummaryError::Decode(path, e))
    }

    /// Writes the index atomically, stamping `updated_at`.
    pub async fn save(&mut self, cache_dir: &Path) -> Result<(), SummaryError> {
        self.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(self).map_err(SummaryError::Encode)?;
        let dir = cache_dir.to_path_buf();
        let path = Self::path_in(cache_dir);
        task::spawn_blocking(move || {
            let mut temp_file =
                NamedTempFile::new_in(&dir).map_err(|e| SummaryError::Write(path.clone(), e))?;
            temp_file
                .write_all(&json)
                .map_err(|e| SummaryError::Write(path.clone(), e))?;
            temp_file
                .persist(&path)
                .map_err(|e| SummaryError::Write(path.clone(), e.error))?;
            Ok::<(), SummaryError>(())
        })
        .await??;
        Ok(())
    }

    pub fn entry(&self, file_name: &str) -> Option<&SummaryEntry> {
        self.files.get(file_name)
    }

    pub fn upsert(&mut self, file_name: &str, entry: SummaryEntry) {
        self.files.insert(file_name.to_string(), entry);
    }
}

/// Compresses a year set into sorted `"YYYY"` / `"YYYY-YYYY"` tokens.
///
/// ```
/// use climate_cache::cache::summary::compress_years;
///
/// let tokens = compress_years([2022, 2020, 2021, 2024]);
/// assert_eq!(tokens, vec!["2020-2022", "2024"]);
/// ```
pub fn compress_years(years: impl IntoIterator<Item = i32>) -> Vec<String> {
    let years: BTreeSet<i32> = years.into_iter().collect();
    let mut tokens = Vec::new();
    let mut iter = years.into_iter();
    let Some(first) = iter.next() else {
        return tokens;
    };
    let (mut start, mut end) = (first, first);
    for year in iter {
        if year == end + 1 {
            end = year;
        } else {
            tokens.push(range_token(start, end));
            start = year;
            end = year;
        }
    }
    tokens.push(range_token(start, end));
    tokens
}

fn range_token(start: i32, end: i32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

/// Expands range tokens back into a year set.
pub fn expand_year_ranges(tokens: &[YearToken]) -> Result<BTreeSet<i32>, SummaryError> {
    let mut years = BTreeSet::new();
    for token in tokens {
        match token {
            YearToken::Year(year) => {
                years.insert(*year);
            }
            YearToken::Text(text) => {
                let invalid = || SummaryError::InvalidRange(text.clone());
                let text = text.trim();
                match text.split_once('-') {
                    Some((start, end)) => {
                        let start: i32 = start.trim().parse().map_err(|_| invalid())?;
                        let end: i32 = end.trim().parse().map_err(|_| invalid())?;
                        if start > end {
                            return Err(invalid());
                        }
                        years.extend(start..=end);
                    }
                    None => {
                        years.insert(text.parse().map_err(|_| invalid())?);
                    }
                }
            }
        }
    }
    Ok(years)
}

/// Best-effort country from a place name such as `"Austin, TX"`.
///
/// A two-letter US state (or DC) suffix yields `"USA"`, any other suffix is kept
/// as written, and a name without a comma yields an empty string.
pub fn country_from_place_name(place_name: &str) -> String {
    let Some((_, suffix)) = place_name.rsplit_once(',') else {
        return String::new();
    };
    let suffix = suffix.trim();
    let upper = suffix.to_uppercase();
    if upper.len() == 2 && US_STATE_CODES.contains(&upper.as_str()) {
        "USA".to_string()
    } else {
        suffix.to_string()
    }
}
