//! Serialized plan document
//!
//! ```yaml
//! version: 1
//! root:
//!   record:
//!     table: specimen
//!     fields:
//!       catalog_number: "Cat #"
//!       remarks: {column: Remarks, match_behavior: ignore_always}
//!     static:
//!       status: active
//!     to_one:
//!       taxon:
//!         tree:
//!           table: taxon
//!           ranks:
//!             - {rank: Kingdom, fields: {name: Kingdom}}
//!             - {rank: Phylum, fields: {name: Phylum}}
//!     to_many:
//!       preparations:
//!         - record: {table: preparation, fields: {kind: "Prep 1"}}
//!         - record: {table: preparation, fields: {kind: "Prep 2"}}
//! ```
//!
//! Child nodes are kept as raw JSON here so the parser can report the exact
//! path of a bad node.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::model::{MatchBehavior, OnMatch};

pub const PLAN_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PlanDocument {
    pub version: u32,
    pub root: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RecordDoc {
    pub table: String,
    #[serde(default, skip_serializing_if = "OnMatch::is_default")]
    pub on_match: OnMatch,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, BindingDoc>,
    #[serde(default, rename = "static", skip_serializing_if = "BTreeMap::is_empty")]
    pub static_values: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub to_one: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub to_many: BTreeMap<String, Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TreeDoc {
    pub table: String,
    #[serde(default, skip_serializing_if = "OnMatch::is_default")]
    pub on_match: OnMatch,
    pub ranks: Vec<RankDoc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RankDoc {
    pub rank: String,
    pub fields: BTreeMap<String, BindingDoc>,
}

/// A bare column label, or a column with options
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BindingDoc {
    Column(String),
    Options(BindingOptionsDoc),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BindingOptionsDoc {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "is_default_behavior")]
    pub match_behavior: MatchBehavior,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub null_allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub value_map: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn is_true(b: &bool) -> bool {
    *b
}

fn is_default_behavior(b: &MatchBehavior) -> bool {
    *b == MatchBehavior::default()
}
