use crate::schema::error::SchemaError;
use crate::types::variable::VariableMetadata;
use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// The registry shipped with the crate.
pub const SCHEMA_REGISTRY_YAML: &str = include_str!("schema.yaml");
const EMBEDDED_ORIGIN: &str = "<embedded schema.yaml>";

/// Version numbers may be written as YAML integers or as quoted strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "RawVersionKey")]
pub struct VersionKey(pub u32);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVersionKey {
    Number(u32),
    Text(String),
}

impl TryFrom<RawVersionKey> for VersionKey {
    type Error = String;

    fn try_from(raw: RawVersionKey) -> Result<Self, Self::Error> {
        match raw {
            RawVersionKey::Number(n) => Ok(VersionKey(n)),
            RawVersionKey::Text(text) => text
                .trim()
                .parse::<u32>()
                .map(VersionKey)
                .map_err(|_| format!("invalid schema version '{text}'")),
        }
    }
}

/// Where a migration looks for the legacy value map of one target path.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldMapping {
    /// A bare dot-separated source path.
    Path(String),
    Rule(MappingRule),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingRule {
    #[serde(default)]
    pub source_path: Option<String>,
    /// Tried in order after `source_path`.
    #[serde(default)]
    pub source_candidates: Vec<String>,
}

impl FieldMapping {
    /// Source paths in the order they should be tried.
    pub fn candidates(&self) -> Vec<&str> {
        match self {
            FieldMapping::Path(path) => vec![path.as_str()],
            FieldMapping::Rule(rule) => rule
                .source_path
                .iter()
                .chain(rule.source_candidates.iter())
                .map(String::as_str)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MigrationMappings {
    #[serde(default)]
    pub field_mappings: BTreeMap<String, FieldMapping>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrentMigration {
    pub from_version: VersionKey,
    #[serde(default)]
    pub field_mappings: BTreeMap<String, FieldMapping>,
}

/// One entry of the `versions` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data_key: Option<String>,
    #[serde(default)]
    pub variables_key: Option<String>,
    #[serde(default)]
    pub primary_variable: Option<String>,
    /// Dot-separated paths that must exist in a document of this version.
    #[serde(default, alias = "required_paths")]
    pub required: Vec<String>,
    /// At least one path of every group must exist.
    #[serde(default, alias = "required_any_of_paths")]
    pub required_any_of: Vec<Vec<String>>,
    #[serde(default, alias = "temperature_key")]
    pub primary_data_path: Option<String>,
    #[serde(default, alias = "legacy_temperature_keys")]
    pub legacy_data_paths: Vec<String>,
    #[serde(default)]
    pub migration: Option<CurrentMigration>,
    #[serde(default)]
    pub migration_from_previous: BTreeMap<VersionKey, MigrationMappings>,
    #[serde(default)]
    pub migration_to_next: Option<MigrationMappings>,
    /// Seed metadata for documents written in this version.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableMetadata>,
    #[serde(default)]
    pub measure_cache_vars: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub measure_value_columns: Option<BTreeMap<String, String>>,
}

impl SchemaDefinition {
    /// Root-level legacy keys declared by this version, primary first, without duplicates.
    pub fn legacy_data_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::new();
        for path in self
            .primary_data_path
            .iter()
            .chain(self.legacy_data_paths.iter())
        {
            if !path.is_empty() && !paths.contains(&path.as_str()) {
                paths.push(path);
            }
        }
        paths
    }
}

#[derive(Deserialize)]
struct RawRegistry {
    #[serde(default)]
    current_version: Option<VersionKey>,
    #[serde(default)]
    versions: serde_yaml::Mapping,
}

/// Immutable view over the versioned schema table.
///
/// Construct it once at startup and pass it (usually behind an `Arc`) to the
/// measure registry and the cache codec.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    current_version: u32,
    versions: BTreeMap<u32, SchemaDefinition>,
    data_key: String,
    variables_key: String,
    primary_variable: String,
}

impl SchemaRegistry {
    /// Loads the registry embedded in the crate.
    pub fn load() -> Result<Self, SchemaError> {
        Self::from_yaml_str(SCHEMA_REGISTRY_YAML, EMBEDDED_ORIGIN)
    }

    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SchemaError::Read(path.to_path_buf(), e))?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, SchemaError> {
        let raw: RawRegistry = serde_yaml::from_str(text).map_err(|e| SchemaError::Parse {
            origin: origin.to_string(),
            source: e,
        })?;

        let invalid = |message: String| SchemaError::InvalidRegistry {
            origin: origin.to_string(),
            message,
        };

        let current_version = raw
            .current_version
            .ok_or_else(|| invalid("missing 'current_version'".to_string()))?
            .0;
        if raw.versions.is_empty() {
            return Err(invalid("'versions' must be a non-empty mapping".to_string()));
        }

        let mut versions = BTreeMap::new();
        for (key, value) in raw.versions {
            let version: VersionKey = serde_yaml::from_value(key)
                .map_err(|e| invalid(format!("invalid version key: {e}")))?;
            let definition: SchemaDefinition =
                serde_yaml::from_value(value).map_err(|e| SchemaError::InvalidDefinition {
                    origin: origin.to_string(),
                    version: version.0,
                    message: e.to_string(),
                })?;
            versions.insert(version.0, definition);
        }

        let current = versions.get(&current_version).ok_or_else(|| {
            invalid(format!(
                "current version {current_version} is not declared under 'versions'"
            ))
        })?;

        for (version, definition) in &versions {
            validate_definition(origin, *version, definition, *version == current_version)?;
        }

        // Validated above: all three are present and non-empty.
        let data_key = current.data_key.clone().unwrap_or_default();
        let variables_key = current.variables_key.clone().unwrap_or_default();
        let primary_variable = current.primary_variable.clone().unwrap_or_default();

        debug!(
            "Loaded cache schema registry from {} (current version {}, {} version(s))",
            origin,
            current_version,
            versions.len()
        );

        Ok(Self {
            current_version,
            versions,
            data_key,
            variables_key,
            primary_variable,
        })
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn data_key(&self) -> &str {
        &self.data_key
    }

    pub fn variables_key(&self) -> &str {
        &self.variables_key
    }

    pub fn primary_variable(&self) -> &str {
        &self.primary_variable
    }

    pub fn current(&self) -> &SchemaDefinition {
        // The constructor guarantees the current version is present.
        &self.versions[&self.current_version]
    }

    pub fn definition(&self, version: u32) -> Option<&SchemaDefinition> {
        self.versions.get(&version)
    }

    /// Path of the primary variable's value map in a current document, e.g. `data.noon_temp_C`.
    pub fn primary_target_path(&self) -> String {
        format!("{}.{}", self.data_key, self.primary_variable)
    }

    /// Mapping declared by the *current* version for documents of `from_version`.
    ///
    /// `migration` (with a matching `from_version`) wins over `migration_from_previous`.
    pub fn current_mapping_for(&self, from_version: u32, target_path: &str) -> Option<&FieldMapping> {
        let current = self.current();
        let direct = current
            .migration
            .as_ref()
            .filter(|m| m.from_version.0 == from_version)
            .and_then(|m| m.field_mappings.get(target_path));
        direct.or_else(|| {
            current
                .migration_from_previous
                .get(&VersionKey(from_version))
                .and_then(|m| m.field_mappings.get(target_path))
        })
    }

    /// Forward mapping declared by the source version itself.
    pub fn forward_mapping_for(&self, from_version: u32, target_path: &str) -> Option<&FieldMapping> {
        self.definition(from_version)?
            .migration_to_next
            .as_ref()
            .and_then(|m| m.field_mappings.get(target_path))
    }
}

fn validate_definition(
    origin: &str,
    version: u32,
    definition: &SchemaDefinition,
    is_current: bool,
) -> Result<(), SchemaError> {
    let fail = |message: String| {
        Err(SchemaError::InvalidDefinition {
            origin: origin.to_string(),
            version,
            message,
        })
    };

    if definition.required.iter().any(String::is_empty) {
        return fail("field 'required' must be a list of non-empty strings".to_string());
    }
    for group in &definition.required_any_of {
        if group.is_empty() || group.iter().any(String::is_empty) {
            return fail(
                "field 'required_any_of' must contain non-empty lists of non-empty strings"
                    .to_string(),
            );
        }
    }

    let mut mapping_tables: Vec<(&str, &BTreeMap<String, FieldMapping>)> = Vec::new();
    if let Some(migration) = &definition.migration {
        mapping_tables.push(("migration", &migration.field_mappings));
    }
    for mappings in definition.migration_from_previous.values() {
        mapping_tables.push(("migration_from_previous", &mappings.field_mappings));
    }
    if let Some(mappings) = &definition.migration_to_next {
        mapping_tables.push(("migration_to_next", &mappings.field_mappings));
    }
    for (section, table) in mapping_tables {
        for (target, mapping) in table {
            let candidates = mapping.candidates();
            if target.is_empty() || candidates.is_empty() || candidates.iter().any(|c| c.is_empty())
            {
                return fail(format!(
                    "field mapping '{target}' in '{section}' needs a non-empty 'source_path' or 'source_candidates'"
                ));
            }
        }
    }

    for (field, table) in [
        ("measure_cache_vars", &definition.measure_cache_vars),
        ("measure_value_columns", &definition.measure_value_columns),
    ] {
        if let Some(table) = table {
            if table.is_empty() || table.iter().any(|(k, v)| k.is_empty() || v.is_empty()) {
                return fail(format!("field '{field}' must be a non-empty mapping of strings"));
            }
        }
    }

    if is_current {
        for (field, value) in [
            ("data_key", &definition.data_key),
            ("variables_key", &definition.variables_key),
            ("primary_variable", &definition.primary_variable),
        ] {
            if value.as_deref().map_or(true, str::is_empty) {
                return fail(format!("current version must define '{field}'"));
            }
        }
    }
    Ok(())
}
