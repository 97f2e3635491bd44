//! Row binding
//!
//! Projects the columns a plan node declares out of one input row and turns
//! their raw text into typed field values. Pure: nothing here touches storage.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::plan::{FieldBinding, MatchBehavior, PlanNode, RecordNode};
use crate::result::ParseFailure;
use crate::schema::{FieldDef, FieldType, TableDef};
use crate::source::Row;
use crate::value::{FieldMap, FieldValue, RecordId};

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// One bound field of a node
#[derive(Debug, Clone, PartialEq)]
pub struct BoundField {
    pub value: FieldValue,
    pub match_behavior: MatchBehavior,
}

/// Typed values for one (row, node) pair
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundValues {
    pub fields: BTreeMap<String, BoundField>,
}

impl BoundValues {
    /// All bound values, nulls included
    pub fn values(&self) -> FieldMap {
        self.fields
            .iter()
            .map(|(name, bound)| (name.clone(), bound.value.clone()))
            .collect()
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field).map(|bound| &bound.value)
    }
}

/// Trimmed column text, or None when absent or blank
pub fn raw_text<'r>(row: &'r Row, column: &str) -> Option<&'r str> {
    row.get(column)
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
}

fn bindings_blank(bindings: &BTreeMap<String, FieldBinding>, row: &Row) -> bool {
    bindings
        .values()
        .all(|binding| raw_text(row, &binding.column).is_none())
}

/// Whether every column under a node is blank. Judged on raw text, so
/// defaults never make a node non-blank. A node without columns is never blank.
pub fn node_is_blank(node: &PlanNode, row: &Row) -> bool {
    let columns = node.columns();
    !columns.is_empty() && columns.iter().all(|column| raw_text(row, column).is_none())
}

pub fn record_is_blank(node: &RecordNode, row: &Row) -> bool {
    let mut any_column = !node.fields.is_empty();
    if !bindings_blank(&node.fields, row) {
        return false;
    }
    for child in node.to_one.values() {
        if child.columns().is_empty() {
            continue;
        }
        any_column = true;
        if !node_is_blank(child, row) {
            return false;
        }
    }
    for slot in node.to_many.values().flatten() {
        if slot.fields.is_empty() && slot.to_one.is_empty() && slot.to_many.is_empty() {
            continue;
        }
        any_column = true;
        if !record_is_blank(slot, row) {
            return false;
        }
    }
    any_column
}

pub fn rank_is_blank(fields: &BTreeMap<String, FieldBinding>, row: &Row) -> bool {
    bindings_blank(fields, row)
}

/// Bind the declared columns of one node, reporting every field that fails
pub fn bind_fields(
    table: &TableDef,
    bindings: &BTreeMap<String, FieldBinding>,
    row: &Row,
) -> Result<BoundValues, Vec<ParseFailure>> {
    let mut bound = BoundValues::default();
    let mut failures = Vec::new();

    for (field, binding) in bindings {
        let Some(def) = table.field(field) else {
            failures.push(failure(field, binding, "field is not declared by the table"));
            continue;
        };
        match bind_one(def, binding, row) {
            Ok(value) => {
                bound.fields.insert(
                    field.clone(),
                    BoundField {
                        value,
                        match_behavior: binding.match_behavior,
                    },
                );
            }
            Err(message) => failures.push(failure(field, binding, message)),
        }
    }

    if failures.is_empty() {
        Ok(bound)
    } else {
        Err(failures)
    }
}

fn failure(field: &str, binding: &FieldBinding, message: impl Into<String>) -> ParseFailure {
    ParseFailure {
        field: field.to_string(),
        column: binding.column.clone(),
        message: message.into(),
    }
}

fn bind_one(def: &FieldDef, binding: &FieldBinding, row: &Row) -> Result<FieldValue, String> {
    let text = raw_text(row, &binding.column)
        .map(|raw| {
            binding
                .value_map
                .get(raw)
                .map(String::as_str)
                .unwrap_or(raw)
        })
        .filter(|text| !text.is_empty())
        .or(binding.default.as_deref());

    let value = match text {
        Some(text) => parse_value(def, binding, text)?,
        None => FieldValue::Null,
    };

    if value.is_null() && (def.required || !binding.null_allowed) {
        return Err("a value is required".to_string());
    }
    Ok(value)
}

/// Parse raw text for a field type
pub fn parse_value(def: &FieldDef, binding: &FieldBinding, text: &str) -> Result<FieldValue, String> {
    match def.field_type {
        FieldType::Text => {
            if let Some(max) = def.max_length {
                let length = text.chars().count();
                if length > max {
                    return Err(format!("'{}' is {} characters long, the limit is {}", text, length, max));
                }
            }
            Ok(FieldValue::Text(text.to_string()))
        }
        FieldType::Integer => text
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| format!("'{}' is not an integer", text)),
        FieldType::Decimal => text
            .parse::<Decimal>()
            .map(FieldValue::Decimal)
            .map_err(|_| format!("'{}' is not a number", text)),
        FieldType::Boolean => parse_bool(text)
            .map(FieldValue::Boolean)
            .ok_or_else(|| format!("'{}' is not a yes/no value", text)),
        FieldType::Date => {
            let format = binding.format.as_deref().unwrap_or(DEFAULT_DATE_FORMAT);
            NaiveDate::parse_from_str(text, format)
                .map(FieldValue::Date)
                .map_err(|_| format!("'{}' is not a date in format {}", text, format))
        }
        FieldType::Json => serde_json::from_str(text)
            .map(FieldValue::Json)
            .map_err(|e| format!("malformed structured value: {}", e)),
        FieldType::Ref => text
            .parse::<RecordId>()
            .map(FieldValue::Ref)
            .map_err(|_| format!("'{}' is not a record id", text)),
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_lowercase().as_str() {
        "yes" | "true" | "1" | "y" => Some(true),
        "no" | "false" | "0" | "n" => Some(false),
        _ => None,
    }
}
