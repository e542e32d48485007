//! Per-variable metadata stored alongside cached values.

use serde::{Deserialize, Serialize};

/// Describes how the values of one cache variable were produced.
///
/// Every field is optional so partially filled legacy metadata survives a
/// read/write cycle unchanged. When written, fields appear in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VariableMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_definition: Option<String>,
    /// Number of decimals values are rounded to before they are stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
}

impl VariableMetadata {
    pub fn new(
        units: &str,
        source_variable: &str,
        source_dataset: &str,
        temporal_definition: &str,
        precision: u32,
    ) -> Self {
        Self {
            units: Some(units.to_string()),
            source_variable: Some(source_variable.to_string()),
            source_dataset: Some(source_dataset.to_string()),
            temporal_definition: Some(temporal_definition.to_string()),
            precision: Some(precision),
        }
    }
}
