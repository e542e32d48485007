//! This module provides the main entry point of the crate: a cache directory paired
//! with a remote [`Fetcher`], so callers can ask for years of climate data and only
//! pay for the years that are not cached yet.

use crate::cache::store::{cache_file_name, CacheStore};
use crate::config::{RetrievalSettings, Settings};
use crate::error::ClimateCacheError;
use crate::measures::registry::MeasureRegistry;
use crate::retrieval::coordinator::{RetrievalCoordinator, RetrievalOutput};
use crate::retrieval::fetcher::Fetcher;
use crate::retrieval::progress::{LogProgress, ProgressObserver};
use crate::types::location::Location;
use crate::types::measure::Measure;
use crate::utils::{ensure_cache_dir_exists, get_cache_dir};
use bon::bon;
use polars::prelude::DataFrame;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;

/// The main client struct of the crate.
///
/// A `ClimateCache` owns one cache directory. Requests go through a
/// [`RetrievalCoordinator`], which serves covered years from the cache and asks
/// the [`Fetcher`] for the rest, one calendar year at a time.
///
/// Create an instance using [`ClimateCache::new()`] for the platform cache
/// directory, [`ClimateCache::with_cache_folder()`] for a custom location, or
/// [`ClimateCache::from_settings()`] for a loaded settings file.
///
/// # Examples
///
/// ```rust
/// # use climate_cache::{ClimateCache, ClimateCacheError, Fetcher};
/// # use std::sync::Arc;
/// # async fn run(fetcher: Arc<dyn Fetcher>) -> Result<(), ClimateCacheError> {
/// let cache = ClimateCache::new(fetcher).await?;
/// // Now you can retrieve data or inspect what is cached
/// # Ok(())
/// # }
/// ```
pub struct ClimateCache {
    store: Arc<CacheStore>,
    coordinator: RetrievalCoordinator,
}

#[bon]
impl ClimateCache {
    /// Creates a client for the cache directory `cache_folder`.
    ///
    /// The directory is created if it doesn't exist. Retrieval uses default
    /// settings and reports progress through the `log` facade.
    ///
    /// # Errors
    ///
    /// Returns [`ClimateCacheError::CacheDirCreation`] if the directory cannot be
    /// created, or a schema/measure error if the embedded schema registry is invalid.
    pub async fn with_cache_folder(
        cache_folder: PathBuf,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ClimateCacheError> {
        Self::build(cache_folder, fetcher, RetrievalSettings::default()).await
    }

    /// Creates a client using the default cache directory.
    ///
    /// The default directory is resolved with the `dirs` crate, typically
    /// `~/.cache/climate_cache` on Linux.
    ///
    /// # Errors
    ///
    /// Returns [`ClimateCacheError::CacheDirResolution`] if the default cache
    /// directory cannot be found, and the errors of [`ClimateCache::with_cache_folder`].
    pub async fn new(fetcher: Arc<dyn Fetcher>) -> Result<Self, ClimateCacheError> {
        let cache_folder = get_cache_dir().map_err(ClimateCacheError::CacheDirResolution)?;
        Self::with_cache_folder(cache_folder, fetcher).await
    }

    /// Creates a client from loaded [`Settings`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use climate_cache::{ClimateCache, ClimateCacheError, Fetcher, Settings};
    /// # use std::sync::Arc;
    /// # async fn run(fetcher: Arc<dyn Fetcher>) -> Result<(), ClimateCacheError> {
    /// let settings = Settings::from_yaml_str("retrieval: {wet_hour_threshold_mm: 0.5}")?;
    /// let cache = ClimateCache::from_settings(&settings, fetcher).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn from_settings(
        settings: &Settings,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ClimateCacheError> {
        let cache_folder = settings.cache_dir()?;
        Self::build(cache_folder, fetcher, settings.retrieval.clone()).await
    }

    async fn build(
        cache_folder: PathBuf,
        fetcher: Arc<dyn Fetcher>,
        settings: RetrievalSettings,
    ) -> Result<Self, ClimateCacheError> {
        ensure_cache_dir_exists(&cache_folder)
            .await
            .map_err(|e| ClimateCacheError::CacheDirCreation(cache_folder.clone(), e))?;
        let measures = Arc::new(MeasureRegistry::load_default()?);
        let store = Arc::new(CacheStore::new(&cache_folder, measures));
        let coordinator = RetrievalCoordinator::new(store.clone(), fetcher, settings)
            .with_observer(Arc::new(LogProgress));
        Ok(Self { store, coordinator })
    }

    /// Adds a progress observer. Observer failures are logged and ignored.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.coordinator = self.coordinator.with_observer(observer);
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Retrieves `measure` for `places` over `start_year..=end_year`.
    ///
    /// Only years missing from the cache are fetched, unless
    /// `overwrite_existing_cache_values` is set, in which case every requested
    /// year is fetched again and fetched values replace cached ones.
    ///
    /// This method uses a builder pattern.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use climate_cache::{ClimateCache, ClimateCacheError, Location, Measure};
    /// # async fn run(cache: ClimateCache) -> Result<(), ClimateCacheError> {
    /// let austin = Location::new("Austin, TX", 30.2672, -97.7431, "America/Chicago");
    /// let output = cache
    ///     .retrieve()
    ///     .places(&[austin])
    ///     .measure(Measure::DailyPrecipitation)
    ///     .start_year(2020)
    ///     .end_year(2023)
    ///     .call()
    ///     .await?;
    /// println!("{} rows, {} failed place(s)", output.data.height(), output.failures.len());
    /// # Ok(())
    /// # }
    /// ```
    #[builder]
    pub async fn retrieve(
        &self,
        places: &[Location],
        measure: Measure,
        start_year: i32,
        end_year: i32,
        overwrite_existing_cache_values: Option<bool>,
    ) -> Result<RetrievalOutput, ClimateCacheError> {
        Ok(self
            .coordinator
            .retrieve()
            .places(places)
            .measure(measure)
            .start_year(start_year)
            .end_year(end_year)
            .maybe_overwrite_existing_cache_values(overwrite_existing_cache_values)
            .call()
            .await?)
    }

    /// Years of `measure` cached for the place named `place_name`.
    ///
    /// Composite measures only report years for which every part is cached.
    pub async fn cached_years(&self, place_name: &str, measure: Measure) -> BTreeSet<i32> {
        self.store
            .covered_years(&cache_file_name(place_name), measure)
            .await
    }

    /// Cached rows of `measure` for `place_name`, without fetching anything.
    pub async fn read_rows(
        &self,
        place_name: &str,
        measure: Measure,
        years: Option<RangeInclusive<i32>>,
    ) -> Result<DataFrame, ClimateCacheError> {
        Ok(self
            .store
            .read_rows(&cache_file_name(place_name), measure, years)
            .await?)
    }

    /// Rescans the cache directory and rewrites the summary index.
    pub async fn rebuild_summary(&self) -> Result<usize, ClimateCacheError> {
        Ok(self.store.rebuild_summary().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::fetcher::{FetchError, FetchOptions};
    use async_trait::async_trait;
    use polars::prelude::*;
    use std::error::Error;

    struct ConstantSolar;

    #[async_trait]
    impl Fetcher for ConstantSolar {
        async fn fetch(
            &self,
            location: &Location,
            _measure: Measure,
            year_start: i32,
            year_end: i32,
            _options: &FetchOptions,
        ) -> Result<DataFrame, FetchError> {
            let dates: Vec<String> = (year_start..=year_end)
                .map(|y| format!("{y}-06-21"))
                .collect();
            let rows = dates.len();
            Ok(DataFrame::new(vec![
                Column::new("date".into(), dates),
                Column::new("solar_energy_MJ_m2".into(), vec![30.123; rows]),
                Column::new("place_name".into(), vec![location.name.as_str(); rows]),
                Column::new("grid_lat".into(), vec![30.25; rows]),
                Column::new("grid_lon".into(), vec![-97.75; rows]),
            ])?)
        }
    }

    #[tokio::test]
    async fn retrieves_and_reports_cached_years() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let folder = dir.path().join("cache");
        let cache = ClimateCache::with_cache_folder(folder.clone(), Arc::new(ConstantSolar)).await?;
        assert!(folder.is_dir());

        let austin = Location::new("Austin, TX", 30.2672, -97.7431, "America/Chicago");
        let output = cache
            .retrieve()
            .places(&[austin])
            .measure(Measure::DailySolarRadiationEnergy)
            .start_year(2021)
            .end_year(2022)
            .call()
            .await?;
        assert_eq!(output.data.height(), 2);
        assert!(folder.join("Austin_TX.yaml").exists());

        assert_eq!(
            cache
                .cached_years("Austin, TX", Measure::DailySolarRadiationEnergy)
                .await,
            BTreeSet::from([2021, 2022])
        );
        let rows = cache
            .read_rows("Austin, TX", Measure::DailySolarRadiationEnergy, Some(2022..=2022))
            .await?;
        assert_eq!(rows.height(), 1);
        assert_eq!(cache.rebuild_summary().await?, 1);
        Ok(())
    }
}
