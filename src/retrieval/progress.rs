//! Progress reporting for long retrievals.

use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;

pub type ProgressError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse phase of work for one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CacheLoad,
    Fetch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::CacheLoad => f.write_str("cache load"),
            Stage::Fetch => f.write_str("fetch"),
        }
    }
}

/// Receives progress events. Every method defaults to doing nothing.
///
/// Errors returned here are logged and otherwise ignored; they never abort a
/// retrieval.
pub trait ProgressObserver: Send + Sync {
    /// `place_number` counts from 1 over the places that need fetching.
    fn on_place_start(
        &self,
        _place: &str,
        _place_number: usize,
        _total_places: usize,
        _total_years: usize,
    ) -> Result<(), ProgressError> {
        Ok(())
    }

    fn on_year_start(
        &self,
        _place: &str,
        _year: i32,
        _year_number: usize,
        _total_years: usize,
    ) -> Result<(), ProgressError> {
        Ok(())
    }

    fn on_year_complete(
        &self,
        _place: &str,
        _year: i32,
        _year_number: usize,
        _total_years: usize,
    ) -> Result<(), ProgressError> {
        Ok(())
    }

    fn on_place_complete(&self, _place: &str) -> Result<(), ProgressError> {
        Ok(())
    }

    fn on_stage(&self, _place: &str, _stage: Stage) -> Result<(), ProgressError> {
        Ok(())
    }
}

/// Writes progress events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressObserver for LogProgress {
    fn on_place_start(
        &self,
        place: &str,
        place_number: usize,
        total_places: usize,
        total_years: usize,
    ) -> Result<(), ProgressError> {
        info!(
            "[{}/{}] Fetching {} year(s) for {}",
            place_number, total_places, total_years, place
        );
        Ok(())
    }

    fn on_year_complete(
        &self,
        place: &str,
        year: i32,
        year_number: usize,
        total_years: usize,
    ) -> Result<(), ProgressError> {
        debug!("{}: {} done ({}/{})", place, year, year_number, total_years);
        Ok(())
    }
}

/// Fans events out to the registered observers.
#[derive(Default, Clone)]
pub struct ProgressManager {
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl ProgressManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn place_start(&self, place: &str, place_number: usize, total_places: usize, total_years: usize) {
        self.dispatch("place start", |o| {
            o.on_place_start(place, place_number, total_places, total_years)
        });
    }

    pub fn year_start(&self, place: &str, year: i32, year_number: usize, total_years: usize) {
        self.dispatch("year start", |o| {
            o.on_year_start(place, year, year_number, total_years)
        });
    }

    pub fn year_complete(&self, place: &str, year: i32, year_number: usize, total_years: usize) {
        self.dispatch("year complete", |o| {
            o.on_year_complete(place, year, year_number, total_years)
        });
    }

    pub fn place_complete(&self, place: &str) {
        self.dispatch("place complete", |o| o.on_place_complete(place));
    }

    pub fn stage(&self, place: &str, stage: Stage) {
        self.dispatch("stage", |o| o.on_stage(place, stage));
    }

    fn dispatch(
        &self,
        event: &str,
        notify: impl Fn(&dyn ProgressObserver) -> Result<(), ProgressError>,
    ) {
        for observer in &self.observers {
            if let Err(e) = notify(observer.as_ref()) {
                warn!("Progress observer failed on {} event: {}", event, e);
            }
        }
    }
}
