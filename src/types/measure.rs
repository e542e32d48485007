//! Logical climate measures a caller can request.

use crate::measures::error::UnsupportedMeasureError;
use std::fmt;
use std::str::FromStr;

/// A logical, user-facing climate quantity.
///
/// Each measure is persisted under exactly one cache variable (see
/// [`crate::MeasureRegistry`]). [`Measure::DailyPrecipitation`] is a composite
/// measure: a year only counts as cached when its hourly companion is cached too.
///
/// # Examples
///
/// ```
/// use climate_cache::Measure;
///
/// let measure: Measure = "precipitation".parse().unwrap();
/// assert_eq!(measure, Measure::DailyPrecipitation);
/// assert_eq!(measure.to_string(), "daily_precipitation");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Measure {
    /// Temperature at local solar noon, one value per day.
    NoonTemperature,
    /// Precipitation total per local calendar day.
    DailyPrecipitation,
    /// Precipitation per UTC hour.
    HourlyPrecipitation,
    /// Incoming solar radiation energy per local calendar day.
    DailySolarRadiationEnergy,
}

impl Measure {
    pub const ALL: [Measure; 4] = [
        Measure::NoonTemperature,
        Measure::DailyPrecipitation,
        Measure::HourlyPrecipitation,
        Measure::DailySolarRadiationEnergy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Measure::NoonTemperature => "noon_temperature",
            Measure::DailyPrecipitation => "daily_precipitation",
            Measure::HourlyPrecipitation => "hourly_precipitation",
            Measure::DailySolarRadiationEnergy => "daily_solar_radiation_energy",
        }
    }

    /// Rows of hourly measures carry a UTC timestamp, and their day level in the
    /// cache document nests an hour map.
    pub fn is_hourly(&self) -> bool {
        matches!(self, Measure::HourlyPrecipitation)
    }

    /// Measures whose cached years must all be present before a year of `self`
    /// counts as covered.
    pub fn required_measures(&self) -> Vec<Measure> {
        match self {
            Measure::DailyPrecipitation => {
                vec![Measure::DailyPrecipitation, Measure::HourlyPrecipitation]
            }
            other => vec![*other],
        }
    }

    pub(crate) fn allowed_names() -> Vec<&'static str> {
        let mut names: Vec<&'static str> = Measure::ALL.iter().map(Measure::name).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Measure {
    type Err = UnsupportedMeasureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "noon_temperature" | "temp" => Ok(Measure::NoonTemperature),
            "daily_precipitation" | "precipitation" => Ok(Measure::DailyPrecipitation),
            "hourly_precipitation" | "hourly_precip" => Ok(Measure::HourlyPrecipitation),
            "daily_solar_radiation_energy" | "solar" => Ok(Measure::DailySolarRadiationEnergy),
            _ => Err(UnsupportedMeasureError::new(s, Measure::allowed_names())),
        }
    }
}
