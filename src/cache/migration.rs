//! Single-hop upgrade of an older cache document to the current schema.

use crate::cache::document::{lookup_path, value_map_from_yaml, CacheDocument};
use crate::cache::error::CacheError;
use crate::measures::registry::MeasureRegistry;
use crate::schema::registry::SchemaDefinition;
use crate::types::location::PlaceRecord;
use log::debug;
use serde_yaml::Value;
use std::path::Path;

/// Root keys that held the temperature map before versioned mappings existed.
const FALLBACK_DATA_PATHS: [&str; 2] = ["noon_temperatures", "temperatures"];

/// Migrates a document of `from_version` to the current version.
///
/// The result holds exactly the place, the primary variable's metadata and its
/// value map. `from_version` must be declared in the registry.
pub fn migrate_document(
    root: &Value,
    from_version: u32,
    path: &Path,
    measures: &MeasureRegistry,
) -> Result<CacheDocument, CacheError> {
    let schema = measures.schema();
    let fail = |message: String| CacheError::Migration {
        path: path.to_path_buf(),
        message,
    };
    let definition = schema
        .definition(from_version)
        .ok_or_else(|| fail(format!("schema version {from_version} is not declared")))?;

    check_required_paths(root, definition).map_err(&fail)?;

    let place_value = lookup_path(root, "place")
        .filter(|v| v.is_mapping())
        .ok_or_else(|| fail("missing 'place' block".to_string()))?;
    let place: PlaceRecord = serde_yaml::from_value(place_value.clone())
        .map_err(|e| fail(format!("invalid 'place' block: {e}")))?;

    let candidates = source_candidates(measures, definition, from_version);
    let (source_path, legacy_values) = candidates
        .iter()
        .find_map(|candidate| {
            lookup_path(root, candidate)
                .filter(|v| v.is_mapping())
                .map(|v| (candidate.clone(), v))
        })
        .ok_or_else(|| {
            fail(format!(
                "no legacy value map found (tried: {})",
                candidates.join(", ")
            ))
        })?;
    let values = value_map_from_yaml(legacy_values)
        .map_err(|e| fail(format!("invalid values under '{source_path}': {e}")))?;

    let primary = schema.primary_variable();
    debug!(
        "Migrating '{}' from schema version {} using '{}'",
        path.display(),
        from_version,
        source_path
    );

    let mut document = CacheDocument::new(schema.current_version(), place);
    document.variables.push((
        primary.to_string(),
        measures
            .metadata_for_cache_variable(primary)
            .unwrap_or_default(),
    ));
    document.data.push((primary.to_string(), values));
    Ok(document)
}

fn check_required_paths(root: &Value, definition: &SchemaDefinition) -> Result<(), String> {
    // A key holding an explicit null still counts as present.
    let present = |path: &str| lookup_path(root, path).is_some();
    if let Some(missing) = definition.required.iter().find(|p| !present(p)) {
        return Err(format!("missing required path '{missing}'"));
    }
    if let Some(group) = definition
        .required_any_of
        .iter()
        .find(|group| !group.iter().any(|p| present(p)))
    {
        return Err(format!("none of the paths [{}] is present", group.join(", ")));
    }
    Ok(())
}

/// Source paths in the order they are tried: the current version's mapping,
/// the source version's forward mapping, then declared and fixed legacy keys.
fn source_candidates(
    measures: &MeasureRegistry,
    definition: &SchemaDefinition,
    from_version: u32,
) -> Vec<String> {
    let schema = measures.schema();
    let target = schema.primary_target_path();
    let mut candidates: Vec<String> = Vec::new();
    let mut push = |path: &str| {
        if !candidates.iter().any(|c| c == path) {
            candidates.push(path.to_string());
        }
    };

    if let Some(mapping) = schema.current_mapping_for(from_version, &target) {
        mapping.candidates().into_iter().for_each(&mut push);
    }
    if let Some(mapping) = schema.forward_mapping_for(from_version, &target) {
        mapping.candidates().into_iter().for_each(&mut push);
    }
    definition.legacy_data_paths().into_iter().for_each(&mut push);
    FALLBACK_DATA_PATHS.into_iter().for_each(&mut push);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::document::DayValue;
    use crate::schema::registry::SchemaRegistry;
    use std::sync::Arc;

    const PLACE: &str = r#"
place:
  name: Testville
  lat: 52.0
  lon: 5.0
  timezone: Europe/Amsterdam
  grid_lat: 52.0
  grid_lon: 5.0
"#;

    fn registry() -> MeasureRegistry {
        MeasureRegistry::load_default().unwrap()
    }

    fn parse(body: &str) -> Value {
        serde_yaml::from_str(&format!("schema_version: 1\n{PLACE}{body}")).unwrap()
    }

    #[test]
    fn migrates_noon_temperatures() {
        let root = parse("noon_temperatures:\n  '2020': {1: {'1': 5.5}}\n");
        let document = migrate_document(&root, 1, Path::new("t.yaml"), &registry()).unwrap();
        assert_eq!(document.schema_version, 2);
        assert_eq!(document.place.name, "Testville");
        assert_eq!(document.variables.len(), 1);
        assert_eq!(document.variables[0].0, "noon_temp_C");
        assert_eq!(document.variables[0].1.units.as_deref(), Some("C"));
        assert_eq!(document.data.len(), 1);
        assert_eq!(
            document.data_for("noon_temp_C").unwrap()[&2020][&1][&1],
            DayValue::Value(5.5)
        );
    }

    #[test]
    fn falls_back_to_forward_mapping_candidates() {
        let root = parse("temp_map_v1:\n  2021: {2: {3: -1.25}}\n");
        let document = migrate_document(&root, 1, Path::new("t.yaml"), &registry()).unwrap();
        assert_eq!(
            document.data_for("noon_temp_C").unwrap()[&2021][&2][&3],
            DayValue::Value(-1.25)
        );
    }

    #[test]
    fn missing_required_place_field_fails() {
        let text = "schema_version: 1\nplace:\n  name: Testville\n  lat: 1.0\nnoon_temperatures: {2020: {1: {1: 1.0}}}\n";
        let root: Value = serde_yaml::from_str(text).unwrap();
        let err = migrate_document(&root, 1, Path::new("t.yaml"), &registry()).unwrap_err();
        match err {
            CacheError::Migration { message, .. } => {
                assert!(message.contains("place.lon"), "{message}")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_value_map_fails() {
        let root = parse("other: {2020: {1: {1: 1.0}}}\n");
        let err = migrate_document(&root, 1, Path::new("t.yaml"), &registry()).unwrap_err();
        assert!(matches!(err, CacheError::Migration { .. }));
    }

    #[test]
    fn declared_legacy_paths_are_consulted() {
        let yaml = r#"
current_version: 3
versions:
  2:
    legacy_temperature_keys: [daily.noon]
  3:
    data_key: data
    variables_key: variables
    primary_variable: noon_temp_C
"#;
        let schema = Arc::new(SchemaRegistry::from_yaml_str(yaml, "test").unwrap());
        let measures = MeasureRegistry::new(schema).unwrap();
        let text = format!("schema_version: 2\n{PLACE}daily:\n  noon: {{2020: {{1: {{1: 7.0}}}}}}\n");
        let root: Value = serde_yaml::from_str(&text).unwrap();
        let document = migrate_document(&root, 2, Path::new("t.yaml"), &measures).unwrap();
        assert_eq!(document.schema_version, 3);
        assert_eq!(
            document.data_for("noon_temp_C").unwrap()[&2020][&1][&1],
            DayValue::Value(7.0)
        );
    }

    #[test]
    fn required_path_holding_null_counts_as_present() {
        let yaml = r#"
current_version: 3
versions:
  2:
    required: [meta.source]
    legacy_temperature_keys: [daily.noon]
  3:
    data_key: data
    variables_key: variables
    primary_variable: noon_temp_C
"#;
        let schema = Arc::new(SchemaRegistry::from_yaml_str(yaml, "test").unwrap());
        let measures = MeasureRegistry::new(schema).unwrap();
        let body = "daily:\n  noon: {2020: {1: {1: 7.0}}}\n";

        let with_null: Value =
            serde_yaml::from_str(&format!("schema_version: 2\n{PLACE}meta: {{source: ~}}\n{body}"))
                .unwrap();
        assert!(migrate_document(&with_null, 2, Path::new("t.yaml"), &measures).is_ok());

        let without: Value =
            serde_yaml::from_str(&format!("schema_version: 2\n{PLACE}meta: {{}}\n{body}")).unwrap();
        let err = migrate_document(&without, 2, Path::new("t.yaml"), &measures).unwrap_err();
        assert!(matches!(err, CacheError::Migration { ref message, .. } if message.contains("meta.source")));
    }
}
