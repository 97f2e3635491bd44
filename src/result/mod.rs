//! Upload results
//!
//! One [`UploadResultNode`] tree per input row, mirroring the plan shape.
//! Every node carries exactly one [`RecordOutcome`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::plan::{PlanNode, RecordNode};
use crate::value::{FieldValue, RecordId};

// =============================================================================
// OUTCOMES
// =============================================================================

/// Decision taken for one plan node of one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// An existing record matched and nothing was written
    Matched { id: RecordId },
    /// An existing record matched and differing fields were updated
    MatchedAndChanged {
        id: RecordId,
        changes: Vec<FieldChange>,
    },
    /// A new record was created
    Uploaded { id: RecordId },
    /// An identity-pack record was updated in place
    Updated {
        id: RecordId,
        changes: Vec<FieldChange>,
    },
    /// An identity-pack record already held the row's values
    NoChange { id: RecordId },
    /// A previously linked record was removed
    Deleted { id: RecordId },
    /// The relationship is empty for this row
    NullRecord,
    /// Several existing records fit the lookup
    MatchedMultiple { candidates: Vec<RecordId> },
    /// A business rule vetoed the write
    FailedBusinessRule { rule: String, message: String },
    /// Column values could not be parsed
    ParseFailures { failures: Vec<ParseFailure> },
    /// Storage disagrees with what the row expects
    Conflict {
        id: Option<RecordId>,
        reason: ConflictReason,
    },
    /// Not applied because a dependency in the same row failed
    PropagatedFailure,
}

impl RecordOutcome {
    /// ID of the live record this outcome resolved to
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            RecordOutcome::Matched { id }
            | RecordOutcome::MatchedAndChanged { id, .. }
            | RecordOutcome::Uploaded { id }
            | RecordOutcome::Updated { id, .. }
            | RecordOutcome::NoChange { id } => Some(*id),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RecordOutcome::MatchedMultiple { .. }
                | RecordOutcome::FailedBusinessRule { .. }
                | RecordOutcome::ParseFailures { .. }
                | RecordOutcome::Conflict { .. }
                | RecordOutcome::PropagatedFailure
        )
    }

    /// Failures after which nothing else in the row is attempted
    pub fn halts_row(&self) -> bool {
        matches!(
            self,
            RecordOutcome::FailedBusinessRule { .. } | RecordOutcome::Conflict { .. }
        )
    }

    /// Field changes applied by this outcome
    pub fn changes(&self) -> &[FieldChange] {
        match self {
            RecordOutcome::MatchedAndChanged { changes, .. }
            | RecordOutcome::Updated { changes, .. } => changes,
            _ => &[],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecordOutcome::Matched { .. } => "matched",
            RecordOutcome::MatchedAndChanged { .. } => "matched_and_changed",
            RecordOutcome::Uploaded { .. } => "uploaded",
            RecordOutcome::Updated { .. } => "updated",
            RecordOutcome::NoChange { .. } => "no_change",
            RecordOutcome::Deleted { .. } => "deleted",
            RecordOutcome::NullRecord => "null_record",
            RecordOutcome::MatchedMultiple { .. } => "matched_multiple",
            RecordOutcome::FailedBusinessRule { .. } => "failed_business_rule",
            RecordOutcome::ParseFailures { .. } => "parse_failures",
            RecordOutcome::Conflict { .. } => "conflict",
            RecordOutcome::PropagatedFailure => "propagated_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: FieldValue,
    pub after: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictReason {
    /// The identity-pack record no longer exists
    Missing,
    /// Stored version differs from the identity pack
    Version { expected: i64, found: i64 },
    /// Storage rejected the write on a unique constraint
    Uniqueness { constraint: String },
    /// A relationship the pack marks empty is linked in storage
    StaleRelationship { relationship: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseFailure {
    pub field: String,
    pub column: String,
    pub message: String,
}

// =============================================================================
// RESULT TREE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankResult {
    pub rank: String,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResultNode {
    pub table: String,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub to_one: BTreeMap<String, UploadResultNode>,
    /// Plan slots in order, followed by any dropped siblings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub to_many: BTreeMap<String, Vec<UploadResultNode>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranks: Vec<RankResult>,
}

impl UploadResultNode {
    pub fn new(table: impl Into<String>, outcome: RecordOutcome) -> Self {
        Self {
            table: table.into(),
            outcome,
            to_one: BTreeMap::new(),
            to_many: BTreeMap::new(),
            ranks: Vec::new(),
        }
    }

    /// The whole subtree of `plan` carrying the same outcome
    pub fn uniform(plan: &PlanNode, outcome: &RecordOutcome) -> Self {
        match plan {
            PlanNode::Record(record) => Self::uniform_record(record, outcome),
            PlanNode::Tree(tree) => {
                let mut node = Self::new(&tree.table, outcome.clone());
                node.ranks = tree
                    .ranks
                    .iter()
                    .map(|rank| RankResult {
                        rank: rank.rank.clone(),
                        outcome: outcome.clone(),
                    })
                    .collect();
                node
            }
        }
    }

    pub fn uniform_record(plan: &RecordNode, outcome: &RecordOutcome) -> Self {
        let mut node = Self::new(&plan.table, outcome.clone());
        for (name, child) in &plan.to_one {
            node.to_one
                .insert(name.clone(), Self::uniform(child, outcome));
        }
        for (name, slots) in &plan.to_many {
            let results = slots
                .iter()
                .map(|slot| Self::uniform_record(slot, outcome))
                .collect();
            node.to_many.insert(name.clone(), results);
        }
        node
    }

    /// Subtree that was not attempted
    pub fn not_attempted(plan: &PlanNode) -> Self {
        Self::uniform(plan, &RecordOutcome::PropagatedFailure)
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.outcome.record_id()
    }

    /// True if this node or anything below it failed
    pub fn has_failure(&self) -> bool {
        self.outcome.is_failure() || self.descendant_failed()
    }

    fn descendant_failed(&self) -> bool {
        self.to_one.values().any(UploadResultNode::has_failure)
            || self
                .to_many
                .values()
                .flatten()
                .any(UploadResultNode::has_failure)
            || self.ranks.iter().any(|r| r.outcome.is_failure())
    }

    /// Mark this node as propagated when something below it failed
    pub fn settle(mut self) -> Self {
        if !self.outcome.is_failure() && self.descendant_failed() {
            self.outcome = RecordOutcome::PropagatedFailure;
        }
        self
    }

    /// Visit every node and rank outcome, with the table it belongs to.
    /// A tree node's own outcome summarizes its ranks and is not visited.
    pub fn for_each_outcome<'a>(&'a self, f: &mut impl FnMut(&'a str, &'a RecordOutcome)) {
        if self.ranks.is_empty() {
            f(&self.table, &self.outcome);
        }
        for rank in &self.ranks {
            f(&self.table, &rank.outcome);
        }
        for child in self.to_one.values() {
            child.for_each_outcome(f);
        }
        for child in self.to_many.values().flatten() {
            child.for_each_outcome(f);
        }
    }
}

// =============================================================================
// ROWS AND BATCHES
// =============================================================================

/// Problems that fail a row outside of any single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum RowFailure {
    /// The store failed for a reason other than a uniqueness violation
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowResult {
    pub row_index: usize,
    pub result: UploadResultNode,
    /// Whether the row's writes were committed
    pub committed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RowFailure>,
}

impl RowResult {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some() || self.result.has_failure()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub rows: Vec<RowResult>,
    /// Outcome label -> number of nodes and ranks with that outcome
    pub counts: BTreeMap<String, usize>,
    pub committed_rows: usize,
    pub failed_rows: usize,
    /// The batch stopped before the last row
    pub cancelled: bool,
}

impl BatchReport {
    pub fn push(&mut self, row: RowResult) {
        row.result.for_each_outcome(&mut |_, outcome| {
            *self.counts.entry(outcome.label().to_string()).or_insert(0) += 1;
        });
        if row.committed {
            self.committed_rows += 1;
        }
        if row.is_failure() {
            self.failed_rows += 1;
        }
        self.rows.push(row);
    }

    pub fn count(&self, label: &str) -> usize {
        self.counts.get(label).copied().unwrap_or(0)
    }

    pub fn has_failures(&self) -> bool {
        self.failed_rows > 0
    }
}
