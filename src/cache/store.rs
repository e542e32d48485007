use crate::cache::codec::{decode, encode, Decoded};
use crate::cache::document::{merge_values, CacheDocument, DayValue, HourMap, ValueMap};
use crate::cache::error::CacheError;
use crate::cache::summary::{SummaryEntry, SummaryIndex};
use crate::cache::table::{
    frame_to_observations, grid_point, observations_to_frame, Observation,
};
use crate::measures::registry::MeasureRegistry;
use crate::types::location::{Location, PlaceRecord};
use crate::types::measure::Measure;
use bon::bon;
use chrono::{Datelike, NaiveDate, Timelike};
use log::{debug, info, warn};
use polars::prelude::DataFrame;
use std::collections::{hash_map::Entry, BTreeSet, HashMap};
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, MutexGuard};
use tokio::{fs, task};

pub const CACHE_FILE_EXTENSION: &str = "yaml";

/// File name of a place's cache document: spaces become `_`, commas are dropped.
///
/// ```
/// use climate_cache::cache_file_name;
///
/// assert_eq!(cache_file_name("Austin, TX"), "Austin_TX.yaml");
/// ```
pub fn cache_file_name(place_name: &str) -> String {
    let stem: String = place_name
        .chars()
        .filter(|c| *c != ',')
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    format!("{stem}.{CACHE_FILE_EXTENSION}")
}

#[derive(Clone)]
struct MemoizedDocument {
    modified: SystemTime,
    len: u64,
    decoded: Decoded,
}

/// Reads and writes the cache documents of one directory and keeps its
/// summary index current.
///
/// All mutation of one file, together with the matching index upsert, happens
/// under that file's lock. Reads need no lock because files are replaced
/// atomically.
pub struct CacheStore {
    cache_dir: PathBuf,
    measures: Arc<MeasureRegistry>,
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    /// `None` until first use. The lock doubles as the index lock.
    summary: Mutex<Option<SummaryIndex>>,
    documents: Mutex<HashMap<PathBuf, MemoizedDocument>>,
}

#[bon]
impl CacheStore {
    pub fn new(cache_dir: &Path, measures: Arc<MeasureRegistry>) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            measures,
            file_locks: Mutex::new(HashMap::new()),
            summary: Mutex::new(None),
            documents: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn measures(&self) -> &MeasureRegistry {
        &self.measures
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.cache_dir.join(file_name)
    }

    pub fn path_for_place(&self, place_name: &str) -> PathBuf {
        self.path_for(&cache_file_name(place_name))
    }

    /// Years cached for exactly `measure` in `file_name`.
    ///
    /// Uses the summary index and falls back to the document when the index has
    /// no usable entry, repairing the index on the way. Failures are logged and
    /// reported as "nothing cached".
    pub async fn cached_years(&self, file_name: &str, measure: Measure) -> BTreeSet<i32> {
        let mut guard = self.loaded_summary().await;
        let index = guard.get_or_insert_with(SummaryIndex::default);
        if let Some(entry) = index.entry(file_name) {
            match entry.years_for(measure) {
                Ok(years) => return years,
                Err(e) => warn!(
                    "Summary entry for '{}' is unusable ({}), reading the cache file instead",
                    file_name, e
                ),
            }
        }

        let path = self.path_for(file_name);
        match self.read_decoded(&path).await {
            Ok(Some(decoded)) => {
                let document = decoded.document();
                let years = document.years_for(self.measures.cache_variable(measure));
                index.upsert(file_name, SummaryEntry::from_document(document, &self.measures));
                if let Err(e) = index.save(&self.cache_dir).await {
                    warn!("Failed to save repaired summary index: {}", e);
                }
                years
            }
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(
                    "Treating '{}' as uncached for {}: {}",
                    path.display(),
                    measure,
                    e
                );
                BTreeSet::new()
            }
        }
    }

    /// Years for which every measure `measure` depends on is cached.
    pub async fn covered_years(&self, file_name: &str, measure: Measure) -> BTreeSet<i32> {
        let mut covered: Option<BTreeSet<i32>> = None;
        for required in measure.required_measures() {
            let years = self.cached_years(file_name, required).await;
            covered = Some(match covered {
                None => years,
                Some(previous) => previous.intersection(&years).copied().collect(),
            });
        }
        covered.unwrap_or_default()
    }

    /// Loads a document, migrating and rewriting it when it is in an older layout.
    ///
    /// `Ok(None)` means the file does not exist.
    pub async fn load_document(&self, file_name: &str) -> Result<Option<CacheDocument>, CacheError> {
        let path = self.path_for(file_name);
        match self.read_decoded(&path).await? {
            None => Ok(None),
            Some(Decoded::Current(document)) => Ok(Some(document)),
            Some(Decoded::Migrated { .. }) => {
                let lock = self.file_lock(&path).await;
                let _guard = lock.lock().await;
                // Re-read under the lock: a concurrent write may have upgraded it already.
                match self.read_decoded(&path).await? {
                    None => Ok(None),
                    Some(Decoded::Current(document)) => Ok(Some(document)),
                    Some(Decoded::Migrated {
                        document,
                        from_version,
                    }) => {
                        info!(
                            "Migrated cache file '{}' from schema version {} to {}",
                            path.display(),
                            from_version,
                            document.schema_version
                        );
                        self.persist(file_name, &document).await?;
                        Ok(Some(document))
                    }
                }
            }
        }
    }

    /// Cached rows of `measure`, optionally restricted to a year range.
    ///
    /// A missing file or variable yields an empty table with the usual columns.
    pub async fn read_rows(
        &self,
        file_name: &str,
        measure: Measure,
        years: Option<RangeInclusive<i32>>,
    ) -> Result<DataFrame, CacheError> {
        self.read_rows_where(file_name, measure, |year| {
            years.as_ref().map_or(true, |range| range.contains(&year))
        })
        .await
    }

    /// Cached rows of `measure` for an arbitrary set of years.
    pub async fn read_rows_for_years(
        &self,
        file_name: &str,
        measure: Measure,
        years: &BTreeSet<i32>,
    ) -> Result<DataFrame, CacheError> {
        self.read_rows_where(file_name, measure, |year| years.contains(&year))
            .await
    }

    async fn read_rows_where(
        &self,
        file_name: &str,
        measure: Measure,
        keep_year: impl Fn(i32) -> bool,
    ) -> Result<DataFrame, CacheError> {
        let value_column = self.measures.value_column(measure);
        let (place, rows) = match self.read_observations(file_name, measure, keep_year).await? {
            Some(found) => found,
            None => (empty_place(), Vec::new()),
        };
        Ok(observations_to_frame(measure, value_column, &place, &rows)?)
    }

    /// Place record and observations of `measure` whose year passes `keep_year`.
    pub(crate) async fn read_observations(
        &self,
        file_name: &str,
        measure: Measure,
        keep_year: impl Fn(i32) -> bool,
    ) -> Result<Option<(PlaceRecord, Vec<Observation>)>, CacheError> {
        let Some(document) = self.load_document(file_name).await? else {
            return Ok(None);
        };
        let rows = document
            .data_for(self.measures.cache_variable(measure))
            .map(|values| flatten_values(values, measure, &keep_year))
            .unwrap_or_default();
        Ok(Some((document.place, rows)))
    }

    /// Stores the rows of `table` under `measure` in `file_name`.
    ///
    /// With `append`, an existing document is merged key by key: a key is written
    /// if `overwrite_existing_values` is set or it is not cached yet. Without
    /// `append` the document is replaced. Returns the document as written.
    #[builder]
    pub async fn write_rows(
        &self,
        file_name: &str,
        location: &Location,
        measure: Measure,
        table: &DataFrame,
        append: Option<bool>,
        overwrite_existing_values: Option<bool>,
    ) -> Result<CacheDocument, CacheError> {
        let append = append.unwrap_or(false);
        let overwrite_existing_values = overwrite_existing_values.unwrap_or(false);
        let cache_variable = self.measures.cache_variable(measure).to_string();
        let value_column = self.measures.value_column(measure);

        let observations = frame_to_observations(table, measure, value_column)?;
        let incoming = self.nest_observations(measure, &observations);

        let path = self.path_for(file_name);
        let lock = self.file_lock(&path).await;
        let _guard = lock.lock().await;

        let existing = if append {
            match self.read_decoded(&path).await {
                Ok(decoded) => decoded.map(Decoded::into_document),
                Err(e) if e.is_schema_rejection() => return Err(e),
                Err(e) => {
                    warn!(
                        "Existing cache file '{}' is unreadable and will be replaced: {}",
                        path.display(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut document = match existing {
            Some(mut document) => {
                document.schema_version = self.measures.schema().current_version();
                document.place = PlaceRecord {
                    grid_lat: document.place.grid_lat,
                    grid_lon: document.place.grid_lon,
                    ..PlaceRecord::from_location(location, 0.0, 0.0)
                };
                merge_values(
                    document.data_entry(&cache_variable),
                    incoming,
                    overwrite_existing_values,
                );
                document
            }
            None => {
                let (grid_lat, grid_lon) =
                    grid_point(table).unwrap_or((location.lat, location.lon));
                let mut document = CacheDocument::new(
                    self.measures.schema().current_version(),
                    PlaceRecord::from_location(location, grid_lat, grid_lon),
                );
                *document.data_entry(&cache_variable) = incoming;
                document
            }
        };
        self.backfill_metadata(&mut document);

        self.persist(file_name, &document).await?;
        info!(
            "Cached {} row(s) of {} for '{}' in '{}'",
            observations.len(),
            measure,
            location.name,
            path.display()
        );
        Ok(document)
    }

    /// Rescans every cache file and replaces the summary index.
    ///
    /// Returns the number of indexed files.
    pub async fn rebuild_summary(&self) -> Result<usize, CacheError> {
        let mut guard = self.summary.lock().await;
        let mut index = self.scan_summary().await;
        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| CacheError::CacheWrite(self.cache_dir.clone(), e))?;
        index.save(&self.cache_dir).await?;
        let count = index.files.len();
        *guard = Some(index);
        Ok(count)
    }

    fn nest_observations(&self, measure: Measure, observations: &[Observation]) -> ValueMap {
        let mut values = ValueMap::new();
        for observation in observations {
            let date = observation.timestamp.date();
            let value = self.measures.round_value(measure, observation.value);
            let days = values
                .entry(date.year())
                .or_default()
                .entry(date.month())
                .or_default();
            if measure.is_hourly() {
                let slot = days
                    .entry(date.day())
                    .or_insert_with(|| DayValue::Hours(HourMap::new()));
                if let DayValue::Value(_) = slot {
                    *slot = DayValue::Hours(HourMap::new());
                }
                if let DayValue::Hours(hours) = slot {
                    hours.insert(observation.timestamp.hour(), value);
                }
            } else {
                days.insert(date.day(), DayValue::Value(value));
            }
        }
        values
    }

    /// Adds metadata for every data variable that has none.
    fn backfill_metadata(&self, document: &mut CacheDocument) {
        let names: Vec<String> = document.data.iter().map(|(name, _)| name.clone()).collect();
        for name in names {
            if document.metadata_for(&name).is_some() {
                continue;
            }
            match self.measures.metadata_for_cache_variable(&name) {
                Some(metadata) => {
                    document.ensure_metadata(&name, metadata);
                }
                None => debug!("No metadata defaults known for cache variable '{}'", name),
            }
        }
    }

    /// Atomically replaces the file, then upserts its summary entry.
    ///
    /// Callers hold the file lock.
    async fn persist(&self, file_name: &str, document: &CacheDocument) -> Result<(), CacheError> {
        let path = self.path_for(file_name);
        let text = encode(document, &self.measures);
        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| CacheError::CacheWrite(self.cache_dir.clone(), e))?;

        let dir = self.cache_dir.clone();
        let target = path.clone();
        task::spawn_blocking(move || {
            let mut temp_file =
                NamedTempFile::new_in(&dir).map_err(|e| CacheError::CacheWrite(target.clone(), e))?;
            temp_file
                .write_all(text.as_bytes())
                .map_err(|e| CacheError::CacheWrite(target.clone(), e))?;
            temp_file
                .persist(&target)
                .map_err(|e| CacheError::CacheWrite(target.clone(), e.error))?;
            Ok::<(), CacheError>(())
        })
        .await??;
        self.documents.lock().await.remove(&path);

        let mut guard = self.loaded_summary().await;
        let index = guard.get_or_insert_with(SummaryIndex::default);
        index.upsert(file_name, SummaryEntry::from_document(document, &self.measures));
        if let Err(e) = index.save(&self.cache_dir).await {
            warn!("Failed to update summary index for '{}': {}", file_name, e);
        }
        Ok(())
    }

    /// Reads and decodes a file without persisting a migration.
    ///
    /// The parsed document is memoized by modification time and size.
    async fn read_decoded(&self, path: &Path) -> Result<Option<Decoded>, CacheError> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::CacheMetadataRead(path.to_path_buf(), e)),
        };
        let modified = metadata.modified().ok();
        let len = metadata.len();

        if let Some(modified) = modified {
            let documents = self.documents.lock().await;
            if let Some(memo) = documents.get(path) {
                if memo.modified == modified && memo.len == len {
                    return Ok(Some(memo.decoded.clone()));
                }
            }
        }

        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::CacheRead(path.to_path_buf(), e)),
        };
        let decoded = decode(&text, path, &self.measures)?;
        if let Some(modified) = modified {
            self.documents.lock().await.insert(
                path.to_path_buf(),
                MemoizedDocument {
                    modified,
                    len,
                    decoded: decoded.clone(),
                },
            );
        }
        Ok(Some(decoded))
    }

    async fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().await;
        match locks.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(Arc::new(Mutex::new(()))).clone(),
        }
    }

    /// The summary guard, loading or rebuilding the index on first use.
    async fn loaded_summary(&self) -> MutexGuard<'_, Option<SummaryIndex>> {
        let mut guard = self.summary.lock().await;
        if guard.is_none() {
            let index = match SummaryIndex::load(&self.cache_dir).await {
                Ok(Some(index)) => index,
                Ok(None) => self.scan_and_save().await,
                Err(e) => {
                    warn!("Summary index is unreadable, rebuilding it: {}", e);
                    self.scan_and_save().await
                }
            };
            *guard = Some(index);
        }
        guard
    }

    async fn scan_and_save(&self) -> SummaryIndex {
        let mut index = self.scan_summary().await;
        if fs::metadata(&self.cache_dir).await.is_ok() {
            if let Err(e) = index.save(&self.cache_dir).await {
                warn!("Failed to save rebuilt summary index: {}", e);
            }
        }
        index
    }

    /// Builds a fresh index from every `*.yaml` file, skipping unreadable ones.
    async fn scan_summary(&self) -> SummaryIndex {
        let mut index = SummaryIndex::default();
        let mut entries = match fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return index,
            Err(e) => {
                warn!(
                    "Failed to scan cache directory '{}': {}",
                    self.cache_dir.display(),
                    e
                );
                return index;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to scan cache directory entry: {}", e);
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CACHE_FILE_EXTENSION) {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            match self.read_decoded(&path).await {
                Ok(Some(decoded)) => {
                    index.upsert(
                        &file_name,
                        SummaryEntry::from_document(decoded.document(), &self.measures),
                    );
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable cache file '{}': {}", path.display(), e),
            }
        }
        info!(
            "Rebuilt summary index for '{}' ({} file(s))",
            self.cache_dir.display(),
            index.files.len()
        );
        index
    }
}

fn empty_place() -> PlaceRecord {
    PlaceRecord {
        name: String::new(),
        lat: 0.0,
        lon: 0.0,
        timezone: String::new(),
        grid_lat: 0.0,
        grid_lon: 0.0,
    }
}

/// Flattens a value map into observations, in chronological order.
///
/// Leaves whose shape does not match the measure, and impossible dates, are skipped.
fn flatten_values(
    values: &ValueMap,
    measure: Measure,
    keep_year: &impl Fn(i32) -> bool,
) -> Vec<Observation> {
    let mut rows = Vec::new();
    for (year, months) in values.iter().filter(|(year, _)| keep_year(**year)) {
        for (month, days) in months {
            for (day, value) in days {
                let Some(date) = NaiveDate::from_ymd_opt(*year, *month, *day) else {
                    continue;
                };
                match (value, measure.is_hourly()) {
                    (DayValue::Value(v), false) => rows.push(Observation::daily(date, *v)),
                    (DayValue::Hours(hours), true) => {
                        for (hour, v) in hours {
                            if let Some(timestamp) = date.and_hms_opt(*hour, 0, 0) {
                                rows.push(Observation {
                                    timestamp,
                                    value: *v,
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    rows
}
