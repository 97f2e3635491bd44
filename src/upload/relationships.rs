//! To-many siblings and cleared relationships

use std::collections::BTreeSet;

use tracing::{info, warn};

use super::ordering::assign_positions;
use super::row::{Link, Referrer, RowContext};
use super::rules::{PendingWrite, WriteAction};
use crate::binder::{raw_text, record_is_blank};
use crate::config::ClearedRelationshipPolicy;
use crate::identity_pack::IdentityNode;
use crate::plan::{NodePath, RecordNode};
use crate::result::{RecordOutcome, UploadResultNode};
use crate::schema::RelationshipDef;
use crate::store::StoreResult;
use crate::value::{FieldMap, FieldValue, RecordId};

impl RowContext<'_> {
    /// Resolve the sibling slots of one to-many relationship, in declared order
    pub(super) async fn resolve_to_many(
        &mut self,
        rel: &RelationshipDef,
        name: &str,
        slots: &[RecordNode],
        path: &NodePath,
        pack: Option<&IdentityNode>,
        parent_id: RecordId,
    ) -> StoreResult<Vec<UploadResultNode>> {
        let child_table = self.table_def(&rel.target)?;
        let positions = match &child_table.ordering_field {
            Some(ordering) => self.sibling_positions(slots, ordering),
            None => vec![None; slots.len()],
        };

        let mut results = Vec::with_capacity(slots.len());
        // Siblings the pack assigns to a slot are never up for matching
        let mut handled: BTreeSet<RecordId> = pack
            .map(|entry| entry.slot_ids(name))
            .unwrap_or_default();
        for (index, slot) in slots.iter().enumerate() {
            if self.halted {
                results.push(UploadResultNode::uniform_record(
                    slot,
                    &RecordOutcome::PropagatedFailure,
                ));
                continue;
            }

            let mut link = Link::default();
            link.inject
                .insert(rel.field.clone(), FieldValue::Ref(parent_id));
            if let (Some(ordering), Some(position)) = (&child_table.ordering_field, positions[index]) {
                link.assigned
                    .insert(ordering.clone(), FieldValue::Integer(position));
            }

            link.claimed = Some(handled.clone());

            let slot_pack = pack.and_then(|entry| entry.slot(name, index));
            let result = Box::pin(self.process_record(
                slot,
                &path.to_many(name, index),
                slot_pack,
                link,
            ))
            .await?;

            handled.extend(result.record_id());
            results.push(result);
        }

        let tracked = pack.is_some_and(|entry| entry.id.is_some() && entry.tracks(name));
        if tracked && !self.halted {
            let dropped = self
                .drop_untracked_siblings(rel, name, path, parent_id, slots.len(), &handled)
                .await?;
            results.extend(dropped);
        }
        Ok(results)
    }

    /// Positions to assign, for slots whose ordering value was left blank
    fn sibling_positions(&self, slots: &[RecordNode], ordering: &str) -> Vec<Option<i64>> {
        let live: Vec<usize> = (0..slots.len())
            .filter(|index| !record_is_blank(&slots[*index], self.row))
            .collect();
        let supplied: Vec<Option<i64>> = live
            .iter()
            .map(|index| supplied_position(&slots[*index], ordering, self.row))
            .collect();

        let mut positions = vec![None; slots.len()];
        for ((index, supplied), position) in live.iter().zip(&supplied).zip(assign_positions(&supplied)) {
            if supplied.is_none() {
                positions[*index] = Some(position);
            }
        }
        positions
    }

    /// Existing children no slot accounts for
    async fn drop_untracked_siblings(
        &mut self,
        rel: &RelationshipDef,
        name: &str,
        path: &NodePath,
        parent_id: RecordId,
        first_index: usize,
        handled: &BTreeSet<RecordId>,
    ) -> StoreResult<Vec<UploadResultNode>> {
        let mut criteria = FieldMap::new();
        criteria.insert(rel.field.clone(), FieldValue::Ref(parent_id));
        let existing = self.tx.find(&rel.target, &criteria).await?;

        let mut results = Vec::new();
        for record in existing.iter().filter(|r| !handled.contains(&r.id)) {
            if self.policy == ClearedRelationshipPolicy::Hold {
                warn!(
                    "{}: holding sibling {} of '{}', it is no longer listed",
                    path, record.id, name
                );
                continue;
            }
            let sibling_path = path.to_many(name, first_index + results.len());
            let outcome = self
                .delete_if_unreferenced(&rel.target, record.id, &sibling_path, None)
                .await?;
            if outcome.is_failure() {
                self.halted = self.halted || outcome.halts_row();
                results.push(UploadResultNode::new(&rel.target, outcome));
                break;
            }
            if matches!(outcome, RecordOutcome::Deleted { .. }) {
                results.push(UploadResultNode::new(&rel.target, outcome));
            }
        }
        Ok(results)
    }

    /// A blank node whose identity pack names a previously linked record
    pub(super) async fn clear_relationship(
        &mut self,
        node: &RecordNode,
        path: &NodePath,
        id: RecordId,
        link: &Link,
    ) -> StoreResult<UploadResultNode> {
        let mut result = UploadResultNode::uniform_record(node, &RecordOutcome::NullRecord);
        match self.policy {
            ClearedRelationshipPolicy::Hold => {
                info!("{}: relationship cleared, holding {} in '{}'", path, id, node.table);
            }
            ClearedRelationshipPolicy::Delete => {
                if self.tx.get(&node.table, id).await?.is_some() {
                    let outcome = self
                        .delete_if_unreferenced(&node.table, id, path, link.referrer.as_ref())
                        .await?;
                    if outcome.halts_row() {
                        self.halted = true;
                    }
                    result.outcome = outcome;
                }
            }
        }
        Ok(result)
    }

    /// Queue a deletion unless another record still references `id`.
    /// `referrer` is the link being removed in this row and does not count.
    async fn delete_if_unreferenced(
        &mut self,
        table: &str,
        id: RecordId,
        path: &NodePath,
        referrer: Option<&Referrer>,
    ) -> StoreResult<RecordOutcome> {
        for (ref_table, field) in self.schema.references_to(table) {
            let mut criteria = FieldMap::new();
            criteria.insert(field.clone(), FieldValue::Ref(id));
            let still_referenced = self
                .tx
                .find(&ref_table, &criteria)
                .await?
                .iter()
                .any(|record| {
                    !referrer.is_some_and(|r| {
                        r.table == ref_table && r.field == field && r.id == record.id
                    })
                });
            if still_referenced {
                warn!(
                    "{}: {} in '{}' is still referenced by '{}.{}', leaving it in place",
                    path, id, table, ref_table, field
                );
                return Ok(RecordOutcome::NullRecord);
            }
        }

        let empty = FieldMap::new();
        let write = PendingWrite {
            path,
            table,
            action: WriteAction::Delete,
            id: Some(id),
            values: &empty,
        };
        if let Err(violation) = self.rules.check(write).await {
            return Ok(RecordOutcome::FailedBusinessRule {
                rule: violation.rule,
                message: violation.message,
            });
        }
        self.pending_deletes.push((table.to_string(), id));
        Ok(RecordOutcome::Deleted { id })
    }
}

/// Ordering value the row supplies for a slot, if any
fn supplied_position(slot: &RecordNode, ordering: &str, row: &crate::source::Row) -> Option<i64> {
    if let Some(binding) = slot.fields.get(ordering) {
        return raw_text(row, &binding.column).and_then(|text| text.parse().ok());
    }
    slot.static_values.get(ordering).and_then(FieldValue::as_integer)
}
