//! Mapping plans
//!
//! A plan says how the columns of an input row bind to fields and
//! relationships of the schema. Documents are parsed once per batch into an
//! immutable [`PlanNode`] tree.

pub mod document;
pub mod model;
pub mod parser;

use std::path::Path;

pub use model::{
    FieldBinding, MatchBehavior, NodePath, OnMatch, PlanNode, RankBinding, RecordNode, TreeNode,
};
pub use parser::{parse_plan, parse_plan_json, parse_plan_yaml, serialize_plan};

use crate::error::{PlanError, UploadError};
use crate::schema::{loader, Schema};

/// A validated mapping plan
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPlan {
    pub root: PlanNode,
}

impl UploadPlan {
    /// Load and validate a plan file (YAML or JSON by extension)
    pub fn from_file(schema: &Schema, path: &Path) -> Result<Self, UploadError> {
        let document = loader::read_document(path).map_err(|e| PlanError::Malformed {
            path: String::new(),
            message: format!("{:#}", e),
        })?;
        Ok(parse_plan(schema, &document)?)
    }

    /// Column labels the plan reads, deduplicated, in first-use order
    pub fn columns(&self) -> Vec<&str> {
        let mut seen = std::collections::BTreeSet::new();
        self.root
            .columns()
            .into_iter()
            .filter(|c| seen.insert(*c))
            .collect()
    }
}
