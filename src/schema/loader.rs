//! Schema and document loading
//!
//! Catalogs and plan documents are accepted as YAML or JSON, chosen by file
//! extension (`.json` is JSON, anything else is read as YAML).

use std::path::Path;

use tracing::info;

use super::Schema;
use crate::error::SchemaError;

/// Parse and validate a catalog from YAML text
pub fn schema_from_yaml(text: &str) -> Result<Schema, SchemaError> {
    let schema: Schema =
        serde_yaml::from_str(text).map_err(|e| SchemaError::Load(e.to_string()))?;
    schema.validate()?;
    Ok(schema)
}

/// Parse and validate a catalog from JSON text
pub fn schema_from_json(text: &str) -> Result<Schema, SchemaError> {
    let schema: Schema =
        serde_json::from_str(text).map_err(|e| SchemaError::Load(e.to_string()))?;
    schema.validate()?;
    Ok(schema)
}

/// Load a catalog file
pub fn load_schema(path: &Path) -> Result<Schema, SchemaError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SchemaError::Load(format!("{}: {}", path.display(), e)))?;

    let schema = if is_json(path) {
        schema_from_json(&content)?
    } else {
        schema_from_yaml(&content)?
    };

    info!(
        "Loaded schema from {} with {} tables",
        path.display(),
        schema.tables.len()
    );
    Ok(schema)
}

/// Read any YAML/JSON document into a JSON value
pub fn read_document(path: &Path) -> anyhow::Result<serde_json::Value> {
    use anyhow::Context;

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    if is_json(path) {
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
