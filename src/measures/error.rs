use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unsupported measure '{measure}'. Allowed: {}", allowed.join(", "))]
pub struct UnsupportedMeasureError {
    pub measure: String,
    pub allowed: Vec<&'static str>,
}

impl UnsupportedMeasureError {
    pub fn new(measure: &str, allowed: Vec<&'static str>) -> Self {
        Self {
            measure: measure.to_string(),
            allowed,
        }
    }
}

#[derive(Debug, Error)]
pub enum MeasureError {
    #[error(transparent)]
    Unsupported(#[from] UnsupportedMeasureError),

    #[error("Invalid measure mapping '{field}' in schema version {version}: {message}")]
    InvalidMapping {
        field: &'static str,
        version: u32,
        message: String,
    },
}
