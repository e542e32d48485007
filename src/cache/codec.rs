//! Text encoding of cache documents and schema-version detection on read.

use crate::cache::document::{
    lookup_path, value_map_from_yaml, CacheDocument, DayMap, DayValue, ValueMap,
};
use crate::cache::error::{CacheError, VersionRejection};
use crate::cache::migration::migrate_document;
use crate::measures::registry::MeasureRegistry;
use crate::types::location::PlaceRecord;
use crate::types::variable::VariableMetadata;
use serde_yaml::Value;
use std::fmt::Write as _;
use std::path::Path;

/// Outcome of decoding a cache file.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The file was already in the current layout.
    Current(CacheDocument),
    /// The file was in an older layout and has been lifted in memory.
    Migrated {
        document: CacheDocument,
        from_version: u32,
    },
}

impl Decoded {
    pub fn document(&self) -> &CacheDocument {
        match self {
            Decoded::Current(document) | Decoded::Migrated { document, .. } => document,
        }
    }

    pub fn into_document(self) -> CacheDocument {
        match self {
            Decoded::Current(document) | Decoded::Migrated { document, .. } => document,
        }
    }
}

/// Parses the text of a cache file, migrating older versions.
///
/// Documents without a version, with a version newer than the registry's current
/// one, or with an older version the registry does not declare are rejected.
pub fn decode(text: &str, path: &Path, measures: &MeasureRegistry) -> Result<Decoded, CacheError> {
    let root: Value =
        serde_yaml::from_str(text).map_err(|e| CacheError::Parse(path.to_path_buf(), e))?;
    if !root.is_mapping() {
        return Err(CacheError::MalformedDocument {
            path: path.to_path_buf(),
            message: "top level is not a mapping".to_string(),
        });
    }

    let schema = measures.schema();
    let version = detect_version(&root).map_err(|reason| CacheError::UnsupportedSchemaVersion {
        path: path.to_path_buf(),
        reason,
    })?;
    let current = schema.current_version();
    let reject = |reason| CacheError::UnsupportedSchemaVersion {
        path: path.to_path_buf(),
        reason,
    };

    if version > current {
        return Err(reject(VersionRejection::Newer {
            found: version,
            supported: current,
        }));
    }
    if version == current {
        return decode_current(&root, path, measures).map(Decoded::Current);
    }
    if schema.definition(version).is_none() {
        return Err(reject(VersionRejection::Unknown(version)));
    }
    let document = migrate_document(&root, version, path, measures)?;
    Ok(Decoded::Migrated {
        document,
        from_version: version,
    })
}

fn detect_version(root: &Value) -> Result<u32, VersionRejection> {
    let raw = match lookup_path(root, "schema_version") {
        None | Some(Value::Null) => return Err(VersionRejection::Missing),
        Some(raw) => raw,
    };
    let parsed = match raw {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= f64::from(u32::MAX))
                    .map(|f| f as u64)
            })
            .and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        let shown = serde_yaml::to_string(raw)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default();
        VersionRejection::Invalid(shown)
    })
}

fn decode_current(
    root: &Value,
    path: &Path,
    measures: &MeasureRegistry,
) -> Result<CacheDocument, CacheError> {
    let schema = measures.schema();
    let malformed = |message: String| CacheError::MalformedDocument {
        path: path.to_path_buf(),
        message,
    };

    if let Some(missing) = schema
        .current()
        .required
        .iter()
        .find(|p| lookup_path(root, p).map_or(true, Value::is_null))
    {
        return Err(malformed(format!("missing required path '{missing}'")));
    }

    let place_value = lookup_path(root, "place")
        .filter(|v| v.is_mapping())
        .ok_or_else(|| malformed("missing 'place' block".to_string()))?;
    let place: PlaceRecord = serde_yaml::from_value(place_value.clone())
        .map_err(|e| malformed(format!("invalid 'place' block: {e}")))?;

    let mut document = CacheDocument::new(schema.current_version(), place);

    let variables_key = schema.variables_key();
    let variables = lookup_path(root, variables_key)
        .and_then(Value::as_mapping)
        .ok_or_else(|| malformed(format!("'{variables_key}' is not a mapping")))?;
    for (name, metadata) in variables {
        let name = name
            .as_str()
            .ok_or_else(|| malformed(format!("non-string key under '{variables_key}'")))?;
        let metadata: VariableMetadata = if metadata.is_null() {
            VariableMetadata::default()
        } else {
            serde_yaml::from_value(metadata.clone())
                .map_err(|e| malformed(format!("invalid metadata for '{name}': {e}")))?
        };
        document.variables.push((name.to_string(), metadata));
    }

    let data_key = schema.data_key();
    let data = lookup_path(root, data_key)
        .and_then(Value::as_mapping)
        .ok_or_else(|| malformed(format!("'{data_key}' is not a mapping")))?;
    for (name, values) in data {
        let name = name
            .as_str()
            .ok_or_else(|| malformed(format!("non-string key under '{data_key}'")))?;
        let values = if values.is_null() {
            ValueMap::new()
        } else {
            value_map_from_yaml(values).map_err(|e| malformed(format!("'{name}': {e}")))?
        };
        document.data.push((name.to_string(), values));
    }
    Ok(document)
}

/// Renders a document in the fixed, diff-friendly layout.
///
/// Key order is `schema_version`, `place`, variables, data. Years and months are
/// sorted and each month's days are written as one flow mapping.
pub fn encode(document: &CacheDocument, measures: &MeasureRegistry) -> String {
    let schema = measures.schema();
    let mut out = String::new();
    let place = &document.place;

    // Writing into a String cannot fail.
    let _ = writeln!(out, "schema_version: {}", document.schema_version);
    out.push_str("place:\n");
    let _ = writeln!(out, "  name: {}", yaml_string(&place.name));
    let _ = writeln!(out, "  lat: {}", format_float(place.lat));
    let _ = writeln!(out, "  lon: {}", format_float(place.lon));
    let _ = writeln!(out, "  timezone: {}", yaml_string(&place.timezone));
    let _ = writeln!(out, "  grid_lat: {}", format_float(place.grid_lat));
    let _ = writeln!(out, "  grid_lon: {}", format_float(place.grid_lon));

    if document.variables.is_empty() {
        let _ = writeln!(out, "{}: {{}}", schema.variables_key());
    } else {
        let _ = writeln!(out, "{}:", schema.variables_key());
        for (name, metadata) in &document.variables {
            write_metadata(&mut out, name, metadata);
        }
    }

    if document.data.is_empty() {
        let _ = writeln!(out, "{}: {{}}", schema.data_key());
    } else {
        let _ = writeln!(out, "{}:", schema.data_key());
        for (name, values) in &document.data {
            write_values(&mut out, name, values);
        }
    }
    out
}

fn write_metadata(out: &mut String, name: &str, metadata: &VariableMetadata) {
    let fields = [
        ("units", metadata.units.as_deref()),
        ("source_variable", metadata.source_variable.as_deref()),
        ("source_dataset", metadata.source_dataset.as_deref()),
        ("temporal_definition", metadata.temporal_definition.as_deref()),
    ];
    if fields.iter().all(|(_, v)| v.is_none()) && metadata.precision.is_none() {
        let _ = writeln!(out, "  {}: {{}}", yaml_string(name));
        return;
    }
    let _ = writeln!(out, "  {}:", yaml_string(name));
    for (field, value) in fields {
        if let Some(value) = value {
            let _ = writeln!(out, "    {field}: {}", yaml_string(value));
        }
    }
    if let Some(precision) = metadata.precision {
        let _ = writeln!(out, "    precision: {precision}");
    }
}

fn write_values(out: &mut String, name: &str, values: &ValueMap) {
    let years: Vec<_> = values
        .iter()
        .filter(|(_, months)| months.values().any(|days| !days.is_empty()))
        .collect();
    if years.is_empty() {
        let _ = writeln!(out, "  {}: {{}}", yaml_string(name));
        return;
    }
    let _ = writeln!(out, "  {}:", yaml_string(name));
    for (year, months) in years {
        let _ = writeln!(out, "    {year}:");
        for (month, days) in months.iter().filter(|(_, days)| !days.is_empty()) {
            let _ = writeln!(out, "      {month}: {}", flow_days(days));
        }
    }
}

fn flow_days(days: &DayMap) -> String {
    let entries: Vec<String> = days
        .iter()
        .map(|(day, value)| match value {
            DayValue::Value(v) => format!("{day}: {}", format_float(*v)),
            DayValue::Hours(hours) => {
                let hours: Vec<String> = hours
                    .iter()
                    .map(|(hour, v)| format!("{hour}: {}", format_float(*v)))
                    .collect();
                format!("{day}: {{{}}}", hours.join(", "))
            }
        })
        .collect();
    format!("{{{}}}", entries.join(", "))
}

/// Formats a float so it reads back as the same YAML float.
///
/// Integral values keep one decimal (`13.0`) so they are not read as integers.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        ".nan".to_string()
    } else if value.is_infinite() {
        let rendered = if value > 0.0 { ".inf" } else { "-.inf" };
        rendered.to_string()
    } else if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn yaml_string(value: &str) -> String {
    match serde_yaml::to_string(value) {
        Ok(rendered) if !rendered.trim_end().contains('\n') => rendered.trim_end().to_string(),
        // Multi-line scalars would break the flat layout; JSON strings are valid YAML.
        _ => serde_json::to_string(value).unwrap_or_else(|_| format!("'{}'", value.replace('\'', "''"))),
    }
}
