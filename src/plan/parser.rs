//! Plan parser and serializer
//!
//! `parse_plan` validates a document against the schema catalog and builds
//! the plan tree; `serialize_plan` emits the canonical document back. For a
//! canonical document `serialize_plan(&parse_plan(schema, doc)?) == doc`.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use super::document::{
    BindingDoc, BindingOptionsDoc, PlanDocument, RankDoc, RecordDoc, TreeDoc, PLAN_VERSION,
};
use super::model::{FieldBinding, NodePath, PlanNode, RankBinding, RecordNode, TreeNode};
use super::UploadPlan;
use crate::error::PlanError;
use crate::schema::{FkSide, RelationshipDef, RelationshipKind, Schema, TableDef};
use crate::value::FieldMap;

/// Parse and validate a plan document
pub fn parse_plan(schema: &Schema, document: &Value) -> Result<UploadPlan, PlanError> {
    let doc: PlanDocument = serde_json::from_value(document.clone()).map_err(|e| {
        PlanError::Malformed {
            path: String::new(),
            message: e.to_string(),
        }
    })?;

    if doc.version != PLAN_VERSION {
        return Err(PlanError::UnsupportedVersion {
            found: doc.version,
            expected: PLAN_VERSION,
        });
    }

    let root = parse_node(schema, &doc.root, &NodePath::root())?;
    Ok(UploadPlan { root })
}

/// Parse a plan from YAML text
pub fn parse_plan_yaml(schema: &Schema, text: &str) -> Result<UploadPlan, PlanError> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| PlanError::Malformed {
        path: String::new(),
        message: e.to_string(),
    })?;
    parse_plan(schema, &value)
}

/// Parse a plan from JSON text
pub fn parse_plan_json(schema: &Schema, text: &str) -> Result<UploadPlan, PlanError> {
    let value: Value = serde_json::from_str(text).map_err(|e| PlanError::Malformed {
        path: String::new(),
        message: e.to_string(),
    })?;
    parse_plan(schema, &value)
}

/// Emit the canonical document for a plan
pub fn serialize_plan(plan: &UploadPlan) -> Value {
    let mut doc = Map::new();
    doc.insert("version".to_string(), Value::from(PLAN_VERSION));
    doc.insert("root".to_string(), node_to_value(&plan.root));
    Value::Object(doc)
}

// ============================================================================
// Parsing
// ============================================================================

fn malformed(path: &NodePath, message: impl ToString) -> PlanError {
    PlanError::Malformed {
        path: path.to_string(),
        message: message.to_string(),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Object(map) if map.is_empty() => "an empty object".to_string(),
        Value::Object(map) => format!(
            "keys [{}]",
            map.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
        Value::Array(_) => "a list".to_string(),
        Value::String(_) => "a string".to_string(),
        Value::Number(_) => "a number".to_string(),
        Value::Bool(_) => "a boolean".to_string(),
        Value::Null => "null".to_string(),
    }
}

fn parse_node(schema: &Schema, value: &Value, path: &NodePath) -> Result<PlanNode, PlanError> {
    let bad_type = || PlanError::BadNodeType {
        path: path.to_string(),
        found: describe(value),
    };

    let map = value.as_object().ok_or_else(bad_type)?;
    if map.len() != 1 {
        return Err(bad_type());
    }

    match map.iter().next() {
        Some((kind, body)) if kind == "record" => {
            let doc: RecordDoc =
                serde_json::from_value(body.clone()).map_err(|e| malformed(path, e))?;
            Ok(PlanNode::Record(parse_record(schema, doc, path)?))
        }
        Some((kind, body)) if kind == "tree" => {
            let doc: TreeDoc =
                serde_json::from_value(body.clone()).map_err(|e| malformed(path, e))?;
            Ok(PlanNode::Tree(parse_tree(schema, doc, path)?))
        }
        _ => Err(bad_type()),
    }
}

fn lookup_table<'s>(
    schema: &'s Schema,
    table: &str,
    path: &NodePath,
) -> Result<&'s TableDef, PlanError> {
    schema.table(table).ok_or_else(|| PlanError::UnknownTable {
        path: path.to_string(),
        table: table.to_string(),
    })
}

fn check_mappable(
    table_name: &str,
    table: &TableDef,
    field: &str,
    path: &NodePath,
) -> Result<(), PlanError> {
    if table.field(field).is_none() {
        return Err(PlanError::UnknownField {
            path: path.to_string(),
            table: table_name.to_string(),
            field: field.to_string(),
        });
    }
    if table.is_protected(field) {
        return Err(PlanError::ProtectedField {
            path: path.to_string(),
            table: table_name.to_string(),
            field: field.to_string(),
        });
    }
    Ok(())
}

fn parse_bindings(
    table_name: &str,
    table: &TableDef,
    docs: BTreeMap<String, BindingDoc>,
    path: &NodePath,
) -> Result<BTreeMap<String, FieldBinding>, PlanError> {
    let mut bindings = BTreeMap::new();
    for (field, doc) in docs {
        check_mappable(table_name, table, &field, path)?;
        let binding = match doc {
            BindingDoc::Column(column) => FieldBinding::column(column),
            BindingDoc::Options(opts) => FieldBinding {
                column: opts.column,
                default: opts.default,
                match_behavior: opts.match_behavior,
                null_allowed: opts.null_allowed,
                format: opts.format,
                value_map: opts.value_map,
            },
        };
        bindings.insert(field, binding);
    }
    Ok(bindings)
}

fn parse_record(schema: &Schema, doc: RecordDoc, path: &NodePath) -> Result<RecordNode, PlanError> {
    let table = lookup_table(schema, &doc.table, path)?;
    let fields = parse_bindings(&doc.table, table, doc.fields, path)?;

    let mut static_values = FieldMap::new();
    for (field, json) in doc.static_values {
        check_mappable(&doc.table, table, &field, path)?;
        let def = table.field(&field).ok_or_else(|| PlanError::UnknownField {
            path: path.to_string(),
            table: doc.table.clone(),
            field: field.clone(),
        })?;
        let value = def
            .field_type
            .value_from_json(&json)
            .map_err(|message| PlanError::InvalidStatic {
                path: path.to_string(),
                field: field.clone(),
                message,
            })?;
        static_values.insert(field, value);
    }

    let mut to_one = BTreeMap::new();
    for (name, child) in doc.to_one {
        let rel = lookup_relationship(table, &doc.table, &name, RelationshipKind::ToOne, path)?;
        let child_path = path.to_one(&name);
        if rel.fk_side() == FkSide::Owner
            && (fields.contains_key(&rel.field) || static_values.contains_key(&rel.field))
        {
            return Err(malformed(
                &child_path,
                format!(
                    "field '{}' is filled by relationship '{}' and cannot also be mapped",
                    rel.field, name
                ),
            ));
        }
        let node = parse_node(schema, &child, &child_path)?;
        check_target(&name, &rel.target, node.table(), &child_path)?;
        to_one.insert(name, node);
    }

    let mut to_many = BTreeMap::new();
    for (name, slots) in doc.to_many {
        let rel = lookup_relationship(table, &doc.table, &name, RelationshipKind::ToMany, path)?;
        let mut records = Vec::with_capacity(slots.len());
        for (index, slot) in slots.iter().enumerate() {
            let slot_path = path.to_many(&name, index);
            match parse_node(schema, slot, &slot_path)? {
                PlanNode::Record(record) => {
                    check_target(&name, &rel.target, &record.table, &slot_path)?;
                    if record.fields.contains_key(&rel.field)
                        || record.static_values.contains_key(&rel.field)
                    {
                        return Err(malformed(
                            &slot_path,
                            format!("field '{}' is filled by the parent record", rel.field),
                        ));
                    }
                    records.push(record);
                }
                PlanNode::Tree(_) => {
                    return Err(PlanError::TreeInToMany {
                        path: slot_path.to_string(),
                    })
                }
            }
        }
        to_many.insert(name, records);
    }

    Ok(RecordNode {
        table: doc.table,
        on_match: doc.on_match,
        fields,
        static_values,
        to_one,
        to_many,
    })
}

fn lookup_relationship<'t>(
    table: &'t TableDef,
    table_name: &str,
    name: &str,
    used_as: RelationshipKind,
    path: &NodePath,
) -> Result<&'t RelationshipDef, PlanError> {
    let rel = table
        .relationships
        .get(name)
        .ok_or_else(|| PlanError::UnknownRelationship {
            path: path.to_string(),
            table: table_name.to_string(),
            relationship: name.to_string(),
        })?;
    if rel.kind != used_as {
        return Err(PlanError::RelationshipKind {
            path: path.to_string(),
            relationship: name.to_string(),
            actual: rel.kind.label(),
            used_as: used_as.label(),
        });
    }
    Ok(rel)
}

fn check_target(
    relationship: &str,
    expected: &str,
    found: &str,
    path: &NodePath,
) -> Result<(), PlanError> {
    if expected != found {
        return Err(PlanError::TargetMismatch {
            path: path.to_string(),
            relationship: relationship.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

fn parse_tree(schema: &Schema, doc: TreeDoc, path: &NodePath) -> Result<TreeNode, PlanError> {
    let table = lookup_table(schema, &doc.table, path)?;
    let tree = table.tree.as_ref().ok_or_else(|| PlanError::NotATree {
        path: path.to_string(),
        table: doc.table.clone(),
    })?;

    let mut seen = BTreeSet::new();
    let mut ranks = Vec::with_capacity(doc.ranks.len());
    for RankDoc { rank, fields } in doc.ranks {
        let Some(index) = tree.rank_index(&rank) else {
            return Err(PlanError::DanglingRank {
                path: path.to_string(),
                table: doc.table.clone(),
                rank,
            });
        };
        if !seen.insert(index) {
            return Err(PlanError::DuplicateRank {
                path: path.to_string(),
                rank,
            });
        }
        let rank_path = path.rank(&rank);
        let fields = parse_bindings(&doc.table, table, fields, &rank_path)?;
        if !fields.contains_key(&tree.name_field) {
            return Err(malformed(
                &rank_path,
                format!("rank does not bind the name field '{}'", tree.name_field),
            ));
        }
        ranks.push((index, RankBinding { rank, fields }));
    }
    ranks.sort_by_key(|(index, _)| *index);

    Ok(TreeNode {
        table: doc.table,
        on_match: doc.on_match,
        ranks: ranks.into_iter().map(|(_, rank)| rank).collect(),
    })
}

// ============================================================================
// Serialization
// ============================================================================

fn binding_to_doc(binding: &FieldBinding) -> BindingDoc {
    if binding.is_bare() {
        return BindingDoc::Column(binding.column.clone());
    }
    BindingDoc::Options(BindingOptionsDoc {
        column: binding.column.clone(),
        default: binding.default.clone(),
        match_behavior: binding.match_behavior,
        null_allowed: binding.null_allowed,
        format: binding.format.clone(),
        value_map: binding.value_map.clone(),
    })
}

fn bindings_to_doc(bindings: &BTreeMap<String, FieldBinding>) -> BTreeMap<String, BindingDoc> {
    bindings
        .iter()
        .map(|(field, binding)| (field.clone(), binding_to_doc(binding)))
        .collect()
}

fn record_to_doc(node: &RecordNode) -> RecordDoc {
    RecordDoc {
        table: node.table.clone(),
        on_match: node.on_match,
        fields: bindings_to_doc(&node.fields),
        static_values: node
            .static_values
            .iter()
            .map(|(field, value)| (field.clone(), value.to_json()))
            .collect(),
        to_one: node
            .to_one
            .iter()
            .map(|(name, child)| (name.clone(), node_to_value(child)))
            .collect(),
        to_many: node
            .to_many
            .iter()
            .map(|(name, slots)| {
                let slots = slots
                    .iter()
                    .map(|slot| tagged("record", record_to_doc(slot)))
                    .collect();
                (name.clone(), slots)
            })
            .collect(),
    }
}

fn tagged<T: serde::Serialize>(kind: &str, body: T) -> Value {
    let mut map = Map::new();
    // Plain data structs with string keys always serialize
    map.insert(
        kind.to_string(),
        serde_json::to_value(body).unwrap_or(Value::Null),
    );
    Value::Object(map)
}

fn node_to_value(node: &PlanNode) -> Value {
    match node {
        PlanNode::Record(record) => tagged("record", record_to_doc(record)),
        PlanNode::Tree(tree) => tagged(
            "tree",
            TreeDoc {
                table: tree.table.clone(),
                on_match: tree.on_match,
                ranks: tree
                    .ranks
                    .iter()
                    .map(|rank| RankDoc {
                        rank: rank.rank.clone(),
                        fields: bindings_to_doc(&rank.fields),
                    })
                    .collect(),
            },
        ),
    }
}
