//! In-memory plan tree
//!
//! Built only by the parser, never mutated afterwards. Every child is owned
//! by exactly one slot of its parent.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::FieldMap;

/// One node of the mapping plan
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    Record(RecordNode),
    Tree(TreeNode),
}

impl PlanNode {
    pub fn table(&self) -> &str {
        match self {
            PlanNode::Record(node) => &node.table,
            PlanNode::Tree(node) => &node.table,
        }
    }

    /// Every column label referenced anywhere below (and including) this node
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            PlanNode::Record(node) => node.collect_columns_record(out),
            PlanNode::Tree(node) => {
                for rank in &node.ranks {
                    out.extend(rank.fields.values().map(|b| b.column.as_str()));
                }
            }
        }
    }
}

impl RecordNode {
    fn collect_columns_record<'a>(&'a self, out: &mut Vec<&'a str>) {
        out.extend(self.fields.values().map(|b| b.column.as_str()));
        for child in self.to_one.values() {
            child.collect_columns(out);
        }
        for slots in self.to_many.values() {
            for slot in slots {
                slot.collect_columns_record(out);
            }
        }
    }
}

/// Flat record: field bindings, static values and relationship sub-plans
#[derive(Debug, Clone, PartialEq)]
pub struct RecordNode {
    pub table: String,
    pub on_match: OnMatch,
    /// Target field -> binding
    pub fields: BTreeMap<String, FieldBinding>,
    pub static_values: FieldMap,
    pub to_one: BTreeMap<String, PlanNode>,
    /// Relationship -> sibling slots in declared order
    pub to_many: BTreeMap<String, Vec<RecordNode>>,
}

/// Hierarchical record bound rank by rank
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub table: String,
    pub on_match: OnMatch,
    /// Coarse to fine, in the tree definition's order
    pub ranks: Vec<RankBinding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankBinding {
    pub rank: String,
    pub fields: BTreeMap<String, FieldBinding>,
}

/// How one input column feeds one target field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBinding {
    pub column: String,
    /// Used only when the column is absent or blank
    pub default: Option<String>,
    pub match_behavior: MatchBehavior,
    pub null_allowed: bool,
    /// Date parse format (chrono syntax)
    pub format: Option<String>,
    /// Raw text -> stored text substitutions
    pub value_map: BTreeMap<String, String>,
}

impl FieldBinding {
    pub fn column(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            default: None,
            match_behavior: MatchBehavior::default(),
            null_allowed: true,
            format: None,
            value_map: BTreeMap::new(),
        }
    }

    /// True when nothing but the column is configured
    pub fn is_bare(&self) -> bool {
        self.default.is_none()
            && self.match_behavior == MatchBehavior::default()
            && self.null_allowed
            && self.format.is_none()
            && self.value_map.is_empty()
    }
}

/// Whether a bound field takes part in matching
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchBehavior {
    /// Blank values are left out of the lookup
    #[default]
    IgnoreWhenBlank,
    /// Blank values must match null in storage
    IgnoreNever,
    /// Never used for lookup; compared after a match
    IgnoreAlways,
}

/// What to do when a single match differs in non-identity fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMatch {
    #[default]
    Ignore,
    Update,
}

impl OnMatch {
    pub fn is_default(&self) -> bool {
        *self == OnMatch::Ignore
    }
}

/// Position of a node within the plan, e.g. `root.preparations[1].agent`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePath(String);

impl NodePath {
    pub fn root() -> Self {
        Self("root".to_string())
    }

    pub fn to_one(&self, relationship: &str) -> Self {
        Self(format!("{}.{}", self.0, relationship))
    }

    pub fn to_many(&self, relationship: &str, index: usize) -> Self {
        Self(format!("{}.{}[{}]", self.0, relationship, index))
    }

    pub fn rank(&self, rank: &str) -> Self {
        Self(format!("{}#{}", self.0, rank))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
