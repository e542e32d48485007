//! Place descriptors: the caller-facing [`Location`] and the persisted [`PlaceRecord`].

use serde::{Deserialize, Serialize};

/// A named place to retrieve climate data for.
///
/// Geocoding and timezone lookup happen outside this crate, so the IANA timezone
/// name is required up front.
///
/// # Examples
///
/// ```
/// use climate_cache::Location;
///
/// let austin = Location::new("Austin, TX", 30.2672, -97.7431, "America/Chicago");
/// assert_eq!(austin.name, "Austin, TX");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// IANA timezone name, e.g. `Europe/Amsterdam`.
    pub tz: String,
}

impl Location {
    pub fn new(name: &str, lat: f64, lon: f64, tz: &str) -> Self {
        Self {
            name: name.to_string(),
            lat,
            lon,
            tz: tz.to_string(),
        }
    }
}

/// Place metadata as stored in a cache document.
///
/// `grid_lat`/`grid_lon` are the coordinates of the nearest reanalysis grid point.
/// They are fixed by the first write and kept on every later merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub timezone: String,
    pub grid_lat: f64,
    pub grid_lon: f64,
}

impl PlaceRecord {
    pub fn from_location(location: &Location, grid_lat: f64, grid_lon: f64) -> Self {
        Self {
            name: location.name.clone(),
            lat: location.lat,
            lon: location.lon,
            timezone: location.tz.clone(),
            grid_lat,
            grid_lon,
        }
    }
}
