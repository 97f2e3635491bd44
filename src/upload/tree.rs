//! Rank-chain walk for tree nodes
//!
//! Ranks are matched or created coarse to fine, each level's id becoming the
//! parent of the next. A blank rank ends the chain; identity packs do not
//! apply to trees.

use tracing::debug;

use super::matcher::NodeRequest;
use super::row::{Link, RowContext};
use crate::binder::{bind_fields, rank_is_blank};
use crate::error::StoreError;
use crate::plan::{NodePath, TreeNode};
use crate::result::{RankResult, RecordOutcome, UploadResultNode};
use crate::store::StoreResult;
use crate::value::{FieldMap, FieldValue, RecordId};

impl RowContext<'_> {
    pub(super) async fn process_tree(
        &mut self,
        node: &TreeNode,
        path: &NodePath,
        link: Link,
    ) -> StoreResult<UploadResultNode> {
        let table = self.table_def(&node.table)?;
        let tree = table.tree.as_ref().ok_or_else(|| {
            StoreError::Backend(format!("'{}' has no tree definition", node.table))
        })?;
        let scope = self.scope.node(path);

        let mut result = UploadResultNode::new(&node.table, RecordOutcome::NullRecord);
        let mut parent: Option<RecordId> = None;
        let mut deepest: Option<RecordOutcome> = None;
        let mut terminated = false;
        let mut failed = false;

        for rank in &node.ranks {
            let outcome = if self.halted || failed {
                RecordOutcome::PropagatedFailure
            } else if terminated || rank_is_blank(&rank.fields, self.row) {
                terminated = true;
                RecordOutcome::NullRecord
            } else {
                match bind_fields(table, &rank.fields, self.row) {
                    Err(failures) => RecordOutcome::ParseFailures { failures },
                    Ok(bound) => {
                        let mut fixed = FieldMap::new();
                        fixed.insert(tree.rank_field.clone(), FieldValue::Text(rank.rank.clone()));
                        match parent {
                            Some(id) => {
                                fixed.insert(tree.parent_field.clone(), FieldValue::Ref(id));
                            }
                            // Only the top rank is known to have no parent
                            None if tree.rank_index(&rank.rank) == Some(0) => {
                                fixed.insert(tree.parent_field.clone(), FieldValue::Null);
                            }
                            None => {}
                        }
                        fixed.extend(link.inject.clone());

                        let rank_path = path.rank(&rank.rank);
                        let request = NodeRequest {
                            path: &rank_path,
                            table: &node.table,
                            on_match: node.on_match,
                            identity: std::slice::from_ref(&tree.name_field),
                            bound,
                            fixed,
                            assigned: FieldMap::new(),
                            claimed: None,
                            scope,
                        };
                        self.decide_match(&request).await?
                    }
                }
            };

            debug!("{}: rank {} {}", path, rank.rank, outcome.label());
            if outcome.is_failure() {
                failed = true;
                if outcome.halts_row() {
                    self.halted = true;
                }
            }
            if let Some(id) = outcome.record_id() {
                parent = Some(id);
                deepest = Some(outcome.clone());
            }
            result.ranks.push(RankResult {
                rank: rank.rank.clone(),
                outcome,
            });
        }

        result.outcome = if failed {
            RecordOutcome::PropagatedFailure
        } else {
            deepest.unwrap_or(RecordOutcome::NullRecord)
        };
        Ok(result)
    }
}
