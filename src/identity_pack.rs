//! Record identity packs (edit mode)
//!
//! A pack mirrors the plan shape for one row and names the records that row
//! is editing in place. Nodes with an id bypass matching; `empty` lists the
//! relationships the caller knows to be unlinked.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::UploadError;
use crate::value::RecordId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityPack {
    pub root: IdentityNode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Version the caller last saw; checked before updating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub to_one: BTreeMap<String, IdentityNode>,
    /// Entries align with the plan's sibling slots by position
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub to_many: BTreeMap<String, Vec<IdentityNode>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub empty: BTreeSet<String>,
}

impl IdentityNode {
    pub fn with_id(id: RecordId, version: Option<i64>) -> Self {
        Self {
            id: Some(id),
            version,
            ..Self::default()
        }
    }

    pub fn to_one(&self, relationship: &str) -> Option<&IdentityNode> {
        self.to_one.get(relationship)
    }

    pub fn slot(&self, relationship: &str, index: usize) -> Option<&IdentityNode> {
        self.to_many.get(relationship).and_then(|slots| slots.get(index))
    }

    /// Whether the pack tracks the relationship at all
    pub fn tracks(&self, relationship: &str) -> bool {
        self.to_one.contains_key(relationship)
            || self.to_many.contains_key(relationship)
            || self.empty.contains(relationship)
    }

    pub fn is_marked_empty(&self, relationship: &str) -> bool {
        self.empty.contains(relationship)
    }

    /// IDs listed for the slots of a to-many relationship
    pub fn slot_ids(&self, relationship: &str) -> BTreeSet<RecordId> {
        self.to_many
            .get(relationship)
            .map(|slots| slots.iter().filter_map(|slot| slot.id).collect())
            .unwrap_or_default()
    }
}

/// Load one pack per row from a JSON array
pub fn load_identity_packs(path: &Path) -> Result<Vec<IdentityPack>, UploadError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
