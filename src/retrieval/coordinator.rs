use crate::cache::store::{cache_file_name, CacheStore};
use crate::cache::table::concat_frames;
use crate::config::RetrievalSettings;
use crate::retrieval::aggregates::{attach_wet_hour_stats, daily_wet_hour_stats, WetHourStats};
use crate::retrieval::error::RetrievalError;
use crate::retrieval::fetcher::Fetcher;
use crate::retrieval::progress::{ProgressManager, ProgressObserver, Stage};
use crate::types::location::Location;
use crate::types::measure::Measure;
use bon::bon;
use chrono::NaiveDate;
use log::{debug, info, warn};
use polars::prelude::DataFrame;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// What a retrieval will do for one place.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacePlan {
    pub location: Location,
    pub file_name: String,
    /// Requested years served from the cache.
    pub covered_years: BTreeSet<i32>,
    /// Requested years to fetch, ascending.
    pub missing_years: Vec<i32>,
}

impl PlacePlan {
    pub fn needs_fetch(&self) -> bool {
        !self.missing_years.is_empty()
    }
}

/// A place whose retrieval failed. Other places are unaffected.
#[derive(Debug)]
pub struct PlaceFailure {
    pub place: String,
    pub error: RetrievalError,
}

#[derive(Debug)]
pub struct RetrievalOutput {
    /// Rows of every place that succeeded, in request order.
    pub data: DataFrame,
    pub failures: Vec<PlaceFailure>,
}

/// Fetches only the years a cache directory is missing and merges them in.
///
/// Places and years are processed one at a time, in request order.
pub struct RetrievalCoordinator {
    store: Arc<CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    settings: RetrievalSettings,
    progress: ProgressManager,
}

#[bon]
impl RetrievalCoordinator {
    pub fn new(store: Arc<CacheStore>, fetcher: Arc<dyn Fetcher>, settings: RetrievalSettings) -> Self {
        Self {
            store,
            fetcher,
            settings,
            progress: ProgressManager::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.progress.register(observer);
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Splits the requested years of every place into covered and missing.
    ///
    /// With `overwrite`, every requested year counts as missing.
    pub async fn plan(
        &self,
        places: &[Location],
        measure: Measure,
        start_year: i32,
        end_year: i32,
        overwrite: bool,
    ) -> Result<Vec<PlacePlan>, RetrievalError> {
        if start_year > end_year {
            return Err(RetrievalError::InvalidYearRange {
                start: start_year,
                end: end_year,
            });
        }
        let mut plans = Vec::with_capacity(places.len());
        for location in places {
            let file_name = cache_file_name(&location.name);
            let cached = if overwrite {
                BTreeSet::new()
            } else {
                self.store.covered_years(&file_name, measure).await
            };
            let (covered, missing_years): (Vec<i32>, Vec<i32>) =
                (start_year..=end_year).partition(|year| cached.contains(year));
            plans.push(PlacePlan {
                location: location.clone(),
                file_name,
                covered_years: covered.into_iter().collect(),
                missing_years,
            });
        }
        Ok(plans)
    }

    /// Returns `measure` for every place over `start_year..=end_year`.
    ///
    /// Covered years come from the cache. Missing years are fetched one calendar
    /// year at a time, written back with `append`, and re-read so every row has
    /// the cached shape. A failing place is reported in
    /// [`RetrievalOutput::failures`] and does not stop the others.
    #[builder]
    pub async fn retrieve(
        &self,
        places: &[Location],
        measure: Measure,
        start_year: i32,
        end_year: i32,
        overwrite_existing_cache_values: Option<bool>,
    ) -> Result<RetrievalOutput, RetrievalError> {
        let overwrite = overwrite_existing_cache_values.unwrap_or(false);
        let plans = self
            .plan(places, measure, start_year, end_year, overwrite)
            .await?;

        let to_fetch: Vec<PlacePlan> = plans.iter().filter(|p| p.needs_fetch()).cloned().collect();
        info!("{}", format_retrieval_summary(&to_fetch));

        let mut frames = Vec::with_capacity(plans.len());
        let mut failures = Vec::new();
        let mut succeeded = Vec::with_capacity(plans.len());
        let mut place_number = 0;
        for plan in &plans {
            if plan.needs_fetch() {
                place_number += 1;
            }
            match self
                .retrieve_place(plan, measure, overwrite, place_number, to_fetch.len())
                .await
            {
                Ok(frame) => {
                    frames.push(frame);
                    succeeded.push(plan);
                }
                Err(e) => {
                    warn!("Retrieval for '{}' failed: {}", plan.location.name, e);
                    failures.push(PlaceFailure {
                        place: plan.location.name.clone(),
                        error: e,
                    });
                }
            }
        }

        let mut data = concat_frames(frames)?;
        if measure == Measure::DailyPrecipitation {
            let stats = self.wet_hour_stats(&succeeded, start_year, end_year).await;
            data = attach_wet_hour_stats(&data, &stats)?;
        }
        Ok(RetrievalOutput { data, failures })
    }

    async fn retrieve_place(
        &self,
        plan: &PlacePlan,
        measure: Measure,
        overwrite: bool,
        place_number: usize,
        total_places: usize,
    ) -> Result<DataFrame, RetrievalError> {
        let place = plan.location.name.as_str();
        let mut frames = Vec::new();

        if !plan.covered_years.is_empty() {
            self.progress.stage(place, Stage::CacheLoad);
            let cached = self
                .store
                .read_rows_for_years(&plan.file_name, measure, &plan.covered_years)
                .await?;
            info!(
                "Loaded {} cached row(s) of {} for '{}'",
                cached.height(),
                measure,
                place
            );
            frames.push(cached);
        }

        if plan.needs_fetch() {
            let total_years = plan.missing_years.len();
            self.progress
                .place_start(place, place_number, total_places, total_years);
            self.progress.stage(place, Stage::Fetch);
            for (index, year) in plan.missing_years.iter().copied().enumerate() {
                self.progress.year_start(place, year, index + 1, total_years);
                for fetched in fetched_measures(measure) {
                    self.fetch_year(plan, fetched, year, overwrite).await?;
                }
                let rows = self
                    .store
                    .read_rows_for_years(&plan.file_name, measure, &BTreeSet::from([year]))
                    .await?;
                frames.push(rows);
                self.progress
                    .year_complete(place, year, index + 1, total_years);
            }
            self.progress.place_complete(place);
        }

        Ok(concat_frames(frames)?)
    }

    /// Fetches one year of `measure` and merges it into the place's cache file.
    async fn fetch_year(
        &self,
        plan: &PlacePlan,
        measure: Measure,
        year: i32,
        overwrite: bool,
    ) -> Result<(), RetrievalError> {
        let location = &plan.location;
        let options = self.settings.fetch_options(measure);
        debug!(
            "Fetching {} for '{}' in {} ({} chunks)",
            measure,
            location.name,
            year,
            options.resolved_chunking(year, year)
        );
        let table = self
            .fetcher
            .fetch(location, measure, year, year, &options)
            .await
            .map_err(|source| RetrievalError::Fetch {
                place: location.name.clone(),
                measure,
                year_start: year,
                year_end: year,
                source,
            })?;
        if table.height() == 0 {
            warn!(
                "Fetcher returned no {} rows for '{}' in {}",
                measure, location.name, year
            );
            return Ok(());
        }
        self.store
            .write_rows()
            .file_name(&plan.file_name)
            .location(location)
            .measure(measure)
            .table(&table)
            .append(true)
            .overwrite_existing_values(overwrite)
            .call()
            .await?;
        Ok(())
    }

    /// Wet-hour statistics from the cached hourly precipitation of each place.
    ///
    /// Hours are read one UTC year beyond each end of the range, since local
    /// days at the edges span two UTC years. Places whose hourly rows cannot be
    /// read contribute nothing, so their daily rows get zero-filled statistics.
    async fn wet_hour_stats(
        &self,
        plans: &[&PlacePlan],
        start_year: i32,
        end_year: i32,
    ) -> HashMap<(String, NaiveDate), WetHourStats> {
        let utc_years = start_year.saturating_sub(1)..=end_year.saturating_add(1);
        let mut stats = HashMap::new();
        for plan in plans {
            let hourly = self
                .store
                .read_observations(&plan.file_name, Measure::HourlyPrecipitation, |year| {
                    utc_years.contains(&year)
                })
                .await;
            let (place, observations) = match hourly {
                Ok(Some(found)) => found,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "Cannot read hourly precipitation for '{}', wet-hour columns default to zero: {}",
                        plan.location.name, e
                    );
                    continue;
                }
            };
            let timezone = if place.timezone.is_empty() {
                plan.location.tz.as_str()
            } else {
                place.timezone.as_str()
            };
            let threshold = self.settings.wet_hour_threshold_mm;
            for (date, day) in daily_wet_hour_stats(&observations, timezone, threshold) {
                stats.insert((place.name.clone(), date), day);
            }
        }
        stats
    }
}

/// Measures fetched together for one requested measure.
///
/// Daily precipitation always brings its hourly companion, which the wet-hour
/// columns are derived from.
fn fetched_measures(measure: Measure) -> Vec<Measure> {
    match measure {
        Measure::DailyPrecipitation => {
            vec![Measure::DailyPrecipitation, Measure::HourlyPrecipitation]
        }
        other => vec![other],
    }
}

/// Banner listing the places that need remote retrieval.
///
/// ```
/// use climate_cache::format_retrieval_summary;
///
/// let banner = format_retrieval_summary(&[]);
/// assert!(banner.contains("All data already cached"));
/// ```
pub fn format_retrieval_summary(places_to_fetch: &[PlacePlan]) -> String {
    let rule = "=".repeat(60);
    let mut lines = vec![rule.clone()];
    if places_to_fetch.is_empty() {
        lines.push("All data already cached - no remote retrieval needed".to_string());
    } else {
        lines.push(format!(
            "Remote retrieval required: {} place(s)",
            places_to_fetch.len()
        ));
        for plan in places_to_fetch {
            lines.push(format!("  • {}", plan.location.name));
        }
    }
    lines.push(rule);
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::summary::{SummaryIndex, YearToken, SUMMARY_FILE_NAME};
    use crate::measures::registry::MeasureRegistry;
    use crate::retrieval::aggregates::{OBSERVED_HOURS_COLUMN, TOTAL_COLUMN, WET_HOURS_COLUMN};
    use crate::retrieval::fetcher::{FetchError, FetchOptions};
    use crate::retrieval::progress::ProgressError;
    use async_trait::async_trait;
    use polars::prelude::*;
    use std::error::Error;
    use std::sync::Mutex;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn Error>>;

    /// Returns fixed rows on 1 January of each year and records every call.
    #[derive(Default)]
    struct MockFetcher {
        calls: Mutex<Vec<(String, Measure, i32)>>,
    }

    impl MockFetcher {
        fn calls(&self) -> Vec<(String, Measure, i32)> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(
            &self,
            location: &Location,
            measure: Measure,
            year_start: i32,
            year_end: i32,
            _options: &FetchOptions,
        ) -> Result<DataFrame, FetchError> {
            self.calls
                .lock()
                .map_err(|e| e.to_string())?
                .push((location.name.clone(), measure, year_start));
            if location.name == "Brokenville" {
                return Err("remote source unavailable".into());
            }
            let (value_column, rows): (&str, Vec<(String, f64)>) = match measure {
                Measure::HourlyPrecipitation => (
                    "precip_mm",
                    (year_start..=year_end)
                        .flat_map(|y| {
                            [
                                (format!("{y}-01-01 10:00:00"), 1.5),
                                (format!("{y}-01-01 11:00:00"), 0.2),
                            ]
                        })
                        .collect(),
                ),
                Measure::DailyPrecipitation => (
                    "precip_mm",
                    (year_start..=year_end)
                        .map(|y| (format!("{y}-01-01"), 3.0))
                        .collect(),
                ),
                Measure::NoonTemperature => (
                    "temp_C",
                    (year_start..=year_end)
                        .map(|y| (format!("{y}-01-01"), 12.5))
                        .collect(),
                ),
                Measure::DailySolarRadiationEnergy => (
                    "solar_energy_MJ_m2",
                    (year_start..=year_end)
                        .map(|y| (format!("{y}-01-01"), 4.2))
                        .collect(),
                ),
            };
            let dates: Vec<String> = rows.iter().map(|(d, _)| d.clone()).collect();
            let values: Vec<f64> = rows.iter().map(|(_, v)| *v).collect();
            Ok(DataFrame::new(vec![
                Column::new("date".into(), dates),
                Column::new(value_column.into(), values),
                Column::new("place_name".into(), vec![location.name.as_str(); rows.len()]),
                Column::new("grid_lat".into(), vec![52.0; rows.len()]),
                Column::new("grid_lon".into(), vec![5.0; rows.len()]),
            ])?)
        }
    }

    struct FailingObserver;

    impl ProgressObserver for FailingObserver {
        fn on_place_start(&self, _: &str, _: usize, _: usize, _: usize) -> Result<(), ProgressError> {
            Err("observer exploded".into())
        }

        fn on_stage(&self, _: &str, _: Stage) -> Result<(), ProgressError> {
            Err("observer exploded".into())
        }
    }

    fn setup() -> Result<(TempDir, Arc<MockFetcher>, RetrievalCoordinator), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let measures = Arc::new(MeasureRegistry::load_default()?);
        let store = Arc::new(CacheStore::new(dir.path(), measures));
        let fetcher = Arc::new(MockFetcher::default());
        let coordinator =
            RetrievalCoordinator::new(store, fetcher.clone(), RetrievalSettings::default());
        Ok((dir, fetcher, coordinator))
    }

    fn testville() -> Location {
        Location::new("Testville", 52.1, 5.1, "Europe/Amsterdam")
    }

    fn column_values(frame: &DataFrame, column: &str) -> Result<Vec<f64>, Box<dyn Error>> {
        Ok(frame
            .column(column)?
            .as_materialized_series()
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .flatten()
            .collect())
    }

    #[tokio::test]
    async fn empty_cache_fetches_and_indexes_requested_years() -> TestResult {
        let (dir, fetcher, coordinator) = setup()?;
        let output = coordinator
            .retrieve()
            .places(&[testville()])
            .measure(Measure::NoonTemperature)
            .start_year(2020)
            .end_year(2021)
            .call()
            .await?;

        assert!(output.failures.is_empty());
        assert_eq!(output.data.height(), 2);
        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(
            coordinator
                .store()
                .cached_years("Testville.yaml", Measure::NoonTemperature)
                .await,
            BTreeSet::from([2020, 2021])
        );

        let index = SummaryIndex::load(dir.path()).await?.ok_or("no summary index")?;
        let entry = index.entry("Testville.yaml").ok_or("no summary entry")?;
        assert_eq!(
            entry.measures["noon_temperature"].year_ranges,
            vec![YearToken::Text("2020-2021".to_string())]
        );
        assert!(dir.path().join(SUMMARY_FILE_NAME).exists());
        Ok(())
    }

    #[tokio::test]
    async fn cached_years_are_not_fetched_again_unless_overwriting() -> TestResult {
        let (_dir, fetcher, coordinator) = setup()?;
        for _ in 0..2 {
            let output = coordinator
                .retrieve()
                .places(&[testville()])
                .measure(Measure::NoonTemperature)
                .start_year(2020)
                .end_year(2020)
                .call()
                .await?;
            assert_eq!(output.data.height(), 1);
        }
        assert_eq!(fetcher.calls().len(), 1);

        coordinator
            .retrieve()
            .places(&[testville()])
            .measure(Measure::NoonTemperature)
            .start_year(2020)
            .end_year(2020)
            .overwrite_existing_cache_values(true)
            .call()
            .await?;
        assert_eq!(fetcher.calls().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn daily_precipitation_without_hourly_is_refetched() -> TestResult {
        let (_dir, fetcher, coordinator) = setup()?;
        let location = testville();
        let cached = DataFrame::new(vec![
            Column::new("date".into(), vec!["2024-01-01"]),
            Column::new("precip_mm".into(), vec![7.0]),
        ])?;
        coordinator
            .store()
            .write_rows()
            .file_name("Testville.yaml")
            .location(&location)
            .measure(Measure::DailyPrecipitation)
            .table(&cached)
            .call()
            .await?;

        let output = coordinator
            .retrieve()
            .places(&[location])
            .measure(Measure::DailyPrecipitation)
            .start_year(2024)
            .end_year(2024)
            .call()
            .await?;

        assert!(fetcher
            .calls()
            .contains(&("Testville".to_string(), Measure::HourlyPrecipitation, 2024)));
        assert_eq!(
            coordinator
                .store()
                .cached_years("Testville.yaml", Measure::HourlyPrecipitation)
                .await,
            BTreeSet::from([2024])
        );
        // The cached daily value wins over the re-fetched one.
        assert_eq!(column_values(&output.data, "precip_mm")?, vec![7.0]);
        assert_eq!(column_values(&output.data, WET_HOURS_COLUMN)?, vec![1.0]);
        assert_eq!(column_values(&output.data, OBSERVED_HOURS_COLUMN)?, vec![2.0]);
        assert_eq!(column_values(&output.data, TOTAL_COLUMN)?, vec![1.7]);
        Ok(())
    }

    #[tokio::test]
    async fn failing_place_is_isolated() -> TestResult {
        let (_dir, _fetcher, coordinator) = setup()?;
        let places = [
            Location::new("Brokenville", 0.0, 0.0, "UTC"),
            testville(),
        ];
        let output = coordinator
            .retrieve()
            .places(&places)
            .measure(Measure::NoonTemperature)
            .start_year(2020)
            .end_year(2021)
            .call()
            .await?;

        assert_eq!(output.data.height(), 2);
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].place, "Brokenville");
        assert!(matches!(
            output.failures[0].error,
            RetrievalError::Fetch { year_start: 2020, .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn wet_hours_group_by_local_date_across_utc_new_year() -> TestResult {
        let (_dir, fetcher, coordinator) = setup()?;
        let location = Location::new("Chicago", 41.88, -87.63, "America/Chicago");
        let file_name = cache_file_name(&location.name);

        // Local 2023-12-31 in Chicago runs from 06:00 UTC to 05:00 UTC the next year.
        let start = NaiveDate::from_ymd_opt(2023, 12, 31)
            .and_then(|d| d.and_hms_opt(6, 0, 0))
            .ok_or("start")?;
        let hours: Vec<String> = (0..24)
            .map(|h| {
                (start + chrono::Duration::hours(h))
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .collect();
        let hourly = DataFrame::new(vec![
            Column::new("date".into(), hours),
            Column::new("precip_mm".into(), vec![2.0; 24]),
        ])?;
        let daily = DataFrame::new(vec![
            Column::new("date".into(), vec!["2023-12-30", "2023-12-31"]),
            Column::new("precip_mm".into(), vec![0.0, 48.0]),
        ])?;
        for (measure, table) in [
            (Measure::HourlyPrecipitation, &hourly),
            (Measure::DailyPrecipitation, &daily),
        ] {
            coordinator
                .store()
                .write_rows()
                .file_name(&file_name)
                .location(&location)
                .measure(measure)
                .table(table)
                .call()
                .await?;
        }

        let output = coordinator
            .retrieve()
            .places(&[location])
            .measure(Measure::DailyPrecipitation)
            .start_year(2023)
            .end_year(2023)
            .call()
            .await?;

        assert!(fetcher.calls().is_empty());
        assert!(output.failures.is_empty());
        assert_eq!(column_values(&output.data, "precip_mm")?, vec![0.0, 48.0]);
        assert_eq!(column_values(&output.data, OBSERVED_HOURS_COLUMN)?, vec![0.0, 24.0]);
        assert_eq!(column_values(&output.data, WET_HOURS_COLUMN)?, vec![0.0, 24.0]);
        assert_eq!(column_values(&output.data, TOTAL_COLUMN)?, vec![0.0, 48.0]);
        Ok(())
    }

    #[tokio::test]
    async fn failing_observer_does_not_abort_retrieval() -> TestResult {
        let (_dir, fetcher, coordinator) = setup()?;
        let coordinator = coordinator.with_observer(Arc::new(FailingObserver));
        let output = coordinator
            .retrieve()
            .places(&[testville()])
            .measure(Measure::DailySolarRadiationEnergy)
            .start_year(2022)
            .end_year(2022)
            .call()
            .await?;
        assert_eq!(output.data.height(), 1);
        assert_eq!(fetcher.calls().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn plan_rejects_reversed_range_and_splits_years() -> TestResult {
        let (_dir, _fetcher, coordinator) = setup()?;
        assert!(matches!(
            coordinator
                .plan(&[testville()], Measure::NoonTemperature, 2021, 2020, false)
                .await,
            Err(RetrievalError::InvalidYearRange { .. })
        ));

        coordinator
            .retrieve()
            .places(&[testville()])
            .measure(Measure::NoonTemperature)
            .start_year(2020)
            .end_year(2020)
            .call()
            .await?;
        let plans = coordinator
            .plan(&[testville()], Measure::NoonTemperature, 2019, 2021, false)
            .await?;
        assert_eq!(plans[0].covered_years, BTreeSet::from([2020]));
        assert_eq!(plans[0].missing_years, vec![2019, 2021]);

        let banner = format_retrieval_summary(&plans);
        assert!(banner.contains("Remote retrieval required: 1 place(s)"));
        assert!(banner.contains("  • Testville"));
        Ok(())
    }
}
