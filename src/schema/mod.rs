//! Schema catalog
//!
//! The subset of the relational schema the engine needs: typed fields,
//! identity criteria, unique constraints, scope and ordering declarations,
//! relationships and tree definitions. These structs map directly to the
//! YAML/JSON catalog files read by [`loader`].

pub mod loader;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::value::{FieldValue, RecordId};

// =============================================================================
// CATALOG
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Schema {
    pub tables: BTreeMap<String, TableDef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TableDef {
    pub fields: BTreeMap<String, FieldDef>,

    /// Fields used to look up existing records. Empty means every bound field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity: Vec<String>,

    /// Unique constraints enforced by storage (each a list of fields)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique: Vec<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeDef>,

    /// Position field among to-many siblings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_field: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, RelationshipDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<TreeDef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDef {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Engine-managed; rejected in plans
    #[serde(default)]
    pub protected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Json,
    Ref,
}

/// Tenant/organizational scope of a table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeDef {
    /// Field on this table holding the scope record id
    pub field: String,
    /// Table the scope id points into
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelationshipDef {
    pub kind: RelationshipKind,
    pub target: String,
    /// Foreign key field; lives on the side given by [`RelationshipDef::fk_side`]
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fk_on: Option<FkSide>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    ToOne,
    ToMany,
}

impl RelationshipKind {
    pub fn label(&self) -> &'static str {
        match self {
            RelationshipKind::ToOne => "to-one",
            RelationshipKind::ToMany => "to-many",
        }
    }
}

/// Which record holds the foreign key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FkSide {
    /// The owning record points at the target (many-to-one)
    #[serde(rename = "self")]
    Owner,
    /// The target points back at the owning record
    Related,
}

impl RelationshipDef {
    pub fn fk_side(&self) -> FkSide {
        match self.kind {
            RelationshipKind::ToMany => FkSide::Related,
            RelationshipKind::ToOne => self.fk_on.unwrap_or(FkSide::Owner),
        }
    }
}

/// Rank-ordered hierarchy stored in one self-referencing table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TreeDef {
    /// Rank names, coarse to fine
    pub ranks: Vec<String>,
    pub name_field: String,
    pub rank_field: String,
    pub parent_field: String,
}

impl TreeDef {
    pub fn rank_index(&self, rank: &str) -> Option<usize> {
        self.ranks.iter().position(|r| r == rank)
    }
}

// =============================================================================
// LOOKUPS
// =============================================================================

impl Schema {
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    /// Every (table, field) pair whose value references records of `target`
    pub fn references_to(&self, target: &str) -> BTreeSet<(String, String)> {
        let mut refs = BTreeSet::new();
        for (owner, table) in &self.tables {
            for rel in table.relationships.values() {
                match rel.fk_side() {
                    FkSide::Owner if rel.target == target => {
                        refs.insert((owner.clone(), rel.field.clone()));
                    }
                    FkSide::Related if owner == target => {
                        refs.insert((rel.target.clone(), rel.field.clone()));
                    }
                    _ => {}
                }
            }
            if let Some(scope) = &table.scope {
                if scope.table == target {
                    refs.insert((owner.clone(), scope.field.clone()));
                }
            }
            if let Some(tree) = &table.tree {
                if owner == target {
                    refs.insert((owner.clone(), tree.parent_field.clone()));
                }
            }
        }
        refs
    }

    /// Check internal consistency of the catalog
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (name, table) in &self.tables {
            let invalid = |message: String| SchemaError::InvalidTable {
                table: name.clone(),
                message,
            };
            let has_field = |field: &str| table.fields.contains_key(field);

            for field in &table.identity {
                if !has_field(field) {
                    return Err(invalid(format!("identity field '{}' is not declared", field)));
                }
            }
            for constraint in &table.unique {
                if constraint.is_empty() {
                    return Err(invalid("empty unique constraint".to_string()));
                }
                if let Some(field) = constraint.iter().find(|f| !has_field(f)) {
                    return Err(invalid(format!("unique field '{}' is not declared", field)));
                }
            }
            if let Some(scope) = &table.scope {
                if !has_field(&scope.field) {
                    return Err(invalid(format!("scope field '{}' is not declared", scope.field)));
                }
                if !self.tables.contains_key(&scope.table) {
                    return Err(invalid(format!("scope table '{}' is not declared", scope.table)));
                }
            }
            if let Some(ordering) = &table.ordering_field {
                match table.fields.get(ordering) {
                    Some(def) if def.field_type == FieldType::Integer => {}
                    Some(_) => {
                        return Err(invalid(format!(
                            "ordering field '{}' must be an integer",
                            ordering
                        )))
                    }
                    None => {
                        return Err(invalid(format!(
                            "ordering field '{}' is not declared",
                            ordering
                        )))
                    }
                }
            }
            if let Some(tree) = &table.tree {
                if tree.ranks.is_empty() {
                    return Err(invalid("tree declares no ranks".to_string()));
                }
                for field in [&tree.name_field, &tree.rank_field, &tree.parent_field] {
                    if !has_field(field) {
                        return Err(invalid(format!("tree field '{}' is not declared", field)));
                    }
                }
            }
            for (rel_name, rel) in &table.relationships {
                let Some(target) = self.tables.get(&rel.target) else {
                    return Err(SchemaError::UnknownTarget {
                        table: name.clone(),
                        relationship: rel_name.clone(),
                        target: rel.target.clone(),
                    });
                };
                if rel.kind == RelationshipKind::ToMany && rel.fk_on == Some(FkSide::Owner) {
                    return Err(invalid(format!(
                        "to-many relationship '{}' cannot keep its key on the owner",
                        rel_name
                    )));
                }
                let fk_table = match rel.fk_side() {
                    FkSide::Owner => table,
                    FkSide::Related => target,
                };
                match fk_table.fields.get(&rel.field) {
                    Some(def) if def.field_type == FieldType::Ref => {}
                    _ => {
                        return Err(invalid(format!(
                            "relationship '{}' needs ref field '{}' on its key side",
                            rel_name, rel.field
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

impl TableDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    /// Fields a plan may not bind or set statically
    pub fn is_protected(&self, field: &str) -> bool {
        if self.fields.get(field).map(|f| f.protected).unwrap_or(false) {
            return true;
        }
        match &self.tree {
            Some(tree) => field == tree.parent_field || field == tree.rank_field,
            None => false,
        }
    }
}

impl FieldType {
    /// Convert a JSON scalar (plan static value, batch scope) into a typed value
    pub fn value_from_json(&self, json: &serde_json::Value) -> Result<FieldValue, String> {
        use serde_json::Value;
        if json.is_null() {
            return Ok(FieldValue::Null);
        }
        match (self, json) {
            (FieldType::Text, Value::String(s)) => Ok(FieldValue::Text(s.clone())),
            (FieldType::Integer, Value::Number(n)) => n
                .as_i64()
                .map(FieldValue::Integer)
                .ok_or_else(|| format!("{} is not an integer", n)),
            (FieldType::Decimal, Value::String(s)) => s
                .parse()
                .map(FieldValue::Decimal)
                .map_err(|e| format!("'{}' is not a decimal: {}", s, e)),
            (FieldType::Decimal, Value::Number(n)) => n
                .to_string()
                .parse()
                .map(FieldValue::Decimal)
                .map_err(|e| format!("{} is not a decimal: {}", n, e)),
            (FieldType::Boolean, Value::Bool(b)) => Ok(FieldValue::Boolean(*b)),
            (FieldType::Date, Value::String(s)) => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(FieldValue::Date)
                .map_err(|e| format!("'{}' is not a date: {}", s, e)),
            (FieldType::Json, v) => Ok(FieldValue::Json(v.clone())),
            (FieldType::Ref, Value::String(s)) => s
                .parse::<RecordId>()
                .map(FieldValue::Ref)
                .map_err(|e| format!("'{}' is not a record id: {}", s, e)),
            (ty, v) => Err(format!("{} does not fit a {:?} field", v, ty)),
        }
    }
}
