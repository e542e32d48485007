use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to read schema registry '{0}'")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse schema registry '{origin}'")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid cache schema registry '{origin}': {message}")]
    InvalidRegistry { origin: String, message: String },

    #[error("Schema version {version} in '{origin}' is invalid: {message}")]
    InvalidDefinition {
        origin: String,
        version: u32,
        message: String,
    },
}
