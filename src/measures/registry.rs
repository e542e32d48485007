use crate::measures::error::{MeasureError, UnsupportedMeasureError};
use crate::schema::registry::SchemaRegistry;
use crate::types::measure::Measure;
use crate::types::variable::VariableMetadata;
use std::collections::BTreeMap;
use std::sync::Arc;

const ERA5_DATASET: &str = "reanalysis-era5-single-levels";

/// Resolves measures to storage keys, table columns and metadata defaults.
///
/// Built once from a [`SchemaRegistry`]; the current schema version may
/// override the cache-variable and value-column tables as a whole.
#[derive(Debug, Clone)]
pub struct MeasureRegistry {
    schema: Arc<SchemaRegistry>,
    cache_vars: BTreeMap<Measure, String>,
    value_columns: BTreeMap<Measure, String>,
}

impl MeasureRegistry {
    pub fn new(schema: Arc<SchemaRegistry>) -> Result<Self, MeasureError> {
        let current = schema.current();
        let version = schema.current_version();

        let cache_vars = match &current.measure_cache_vars {
            Some(table) => resolve_override("measure_cache_vars", version, table)?,
            None => Measure::ALL
                .iter()
                .map(|m| (*m, default_cache_variable(*m).to_string()))
                .collect(),
        };
        let pinned = &cache_vars[&Measure::NoonTemperature];
        if pinned != schema.primary_variable() {
            return Err(MeasureError::InvalidMapping {
                field: "measure_cache_vars",
                version,
                message: format!(
                    "noon_temperature must map to primary variable '{}', found '{}'",
                    schema.primary_variable(),
                    pinned
                ),
            });
        }

        let value_columns = match &current.measure_value_columns {
            Some(table) => resolve_override("measure_value_columns", version, table)?,
            None => Measure::ALL
                .iter()
                .map(|m| (*m, default_value_column(*m).to_string()))
                .collect(),
        };

        Ok(Self {
            schema,
            cache_vars,
            value_columns,
        })
    }

    /// Registry backed by the embedded schema.
    pub fn load_default() -> Result<Self, crate::ClimateCacheError> {
        let schema = SchemaRegistry::load()?;
        Ok(Self::new(Arc::new(schema))?)
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn cache_variable(&self, measure: Measure) -> &str {
        &self.cache_vars[&measure]
    }

    pub fn value_column(&self, measure: Measure) -> &str {
        &self.value_columns[&measure]
    }

    /// Like [`Self::cache_variable`] but for a measure given by name.
    pub fn cache_variable_for(&self, measure: &str) -> Result<&str, UnsupportedMeasureError> {
        let measure: Measure = measure.parse()?;
        Ok(self.cache_variable(measure))
    }

    pub fn value_column_for(&self, measure: &str) -> Result<&str, UnsupportedMeasureError> {
        let measure: Measure = measure.parse()?;
        Ok(self.value_column(measure))
    }

    pub fn measure_for_cache_variable(&self, cache_variable: &str) -> Option<Measure> {
        self.cache_vars
            .iter()
            .find(|(_, var)| var.as_str() == cache_variable)
            .map(|(measure, _)| *measure)
    }

    pub fn metadata_defaults(&self, measure: Measure) -> VariableMetadata {
        match measure {
            Measure::NoonTemperature => VariableMetadata::new(
                "C",
                "2m_temperature",
                ERA5_DATASET,
                "daily_local_noon",
                2,
            ),
            Measure::DailyPrecipitation => VariableMetadata::new(
                "mm",
                "total_precipitation",
                ERA5_DATASET,
                "daily_total_local",
                2,
            ),
            Measure::HourlyPrecipitation => VariableMetadata::new(
                "mm",
                "total_precipitation",
                ERA5_DATASET,
                "hourly_utc",
                3,
            ),
            Measure::DailySolarRadiationEnergy => VariableMetadata::new(
                "MJ m-2",
                "surface_solar_radiation_downwards",
                ERA5_DATASET,
                "daily_total_local",
                2,
            ),
        }
    }

    /// Metadata for a cache variable: the schema template entry, with gaps
    /// filled from the owning measure's defaults.
    pub fn metadata_for_cache_variable(&self, cache_variable: &str) -> Option<VariableMetadata> {
        let template = self.schema.current().variables.get(cache_variable).cloned();
        let defaults = self
            .measure_for_cache_variable(cache_variable)
            .map(|m| self.metadata_defaults(m));
        match (template, defaults) {
            (Some(mut template), Some(defaults)) => {
                template.units = template.units.or(defaults.units);
                template.source_variable = template.source_variable.or(defaults.source_variable);
                template.source_dataset = template.source_dataset.or(defaults.source_dataset);
                template.temporal_definition = template
                    .temporal_definition
                    .or(defaults.temporal_definition);
                template.precision = template.precision.or(defaults.precision);
                Some(template)
            }
            (template, defaults) => template.or(defaults),
        }
    }

    pub fn precision(&self, measure: Measure) -> u32 {
        self.metadata_for_cache_variable(self.cache_variable(measure))
            .and_then(|m| m.precision)
            .unwrap_or(2)
    }

    pub fn round_value(&self, measure: Measure, value: f64) -> f64 {
        let factor = 10f64.powi(self.precision(measure) as i32);
        (value * factor).round() / factor
    }
}

fn default_cache_variable(measure: Measure) -> &'static str {
    match measure {
        Measure::NoonTemperature => "noon_temp_C",
        Measure::DailyPrecipitation => "daily_precip_mm",
        Measure::HourlyPrecipitation => "hourly_precip_mm",
        Measure::DailySolarRadiationEnergy => "daily_solar_radiation_MJ_m2",
    }
}

fn default_value_column(measure: Measure) -> &'static str {
    match measure {
        Measure::NoonTemperature => "temp_C",
        Measure::DailyPrecipitation | Measure::HourlyPrecipitation => "precip_mm",
        Measure::DailySolarRadiationEnergy => "solar_energy_MJ_m2",
    }
}

fn resolve_override(
    field: &'static str,
    version: u32,
    table: &BTreeMap<String, String>,
) -> Result<BTreeMap<Measure, String>, MeasureError> {
    let mut resolved = BTreeMap::new();
    for (name, value) in table {
        let measure: Measure = name.parse()?;
        resolved.insert(measure, value.clone());
    }
    let missing: Vec<&str> = Measure::ALL
        .iter()
        .filter(|m| !resolved.contains_key(m))
        .map(Measure::name)
        .collect();
    if !missing.is_empty() {
        return Err(MeasureError::InvalidMapping {
            field,
            version,
            message: format!("missing built-in measure(s): {}", missing.join(", ")),
        });
    }
    Ok(resolved)
}
