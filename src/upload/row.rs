//! Per-row processing
//!
//! A [`RowContext`] owns the row's transaction and walks the plan top-down.
//! Owner-side to-one children resolve before their parent (the parent needs
//! their ids); related-side children and to-many siblings resolve after it.

use std::collections::BTreeSet;

use tracing::debug;

use super::matcher::NodeRequest;
use super::rules::BusinessRules;
use crate::binder::{bind_fields, record_is_blank};
use crate::config::ClearedRelationshipPolicy;
use crate::error::StoreError;
use crate::identity_pack::IdentityNode;
use crate::plan::{NodePath, PlanNode, RecordNode};
use crate::result::{RecordOutcome, UploadResultNode};
use crate::schema::{FkSide, RelationshipDef, Schema, TableDef};
use crate::scope::ScopeContext;
use crate::source::Row;
use crate::store::{StoreResult, StoreTransaction};
use crate::value::{FieldMap, FieldValue, RecordId};

/// How a node hangs off its parent
#[derive(Debug, Default)]
pub(super) struct Link {
    /// Foreign key this node must carry (related-side relationships)
    pub inject: FieldMap,
    /// Engine-assigned values such as the sibling position
    pub assigned: FieldMap,
    /// Edited record whose foreign key points at this node
    pub referrer: Option<Referrer>,
    /// Set for to-many slots: siblings already taken by earlier slots
    pub claimed: Option<BTreeSet<RecordId>>,
    pub is_root: bool,
}

#[derive(Debug, Clone)]
pub(super) struct Referrer {
    pub table: String,
    pub field: String,
    pub id: RecordId,
}

pub(super) struct RowContext<'a> {
    pub tx: Box<dyn StoreTransaction>,
    pub schema: &'a Schema,
    pub scope: &'a ScopeContext,
    pub rules: &'a dyn BusinessRules,
    pub policy: ClearedRelationshipPolicy,
    pub row: &'a Row,
    /// Set by failures that stop the rest of the row
    pub halted: bool,
    /// Deletions run just before commit, after parents dropped their links
    pub pending_deletes: Vec<(String, RecordId)>,
}

impl<'a> RowContext<'a> {
    pub fn new(
        tx: Box<dyn StoreTransaction>,
        schema: &'a Schema,
        scope: &'a ScopeContext,
        rules: &'a dyn BusinessRules,
        policy: ClearedRelationshipPolicy,
        row: &'a Row,
    ) -> Self {
        Self {
            tx,
            schema,
            scope,
            rules,
            policy,
            row,
            halted: false,
            pending_deletes: Vec::new(),
        }
    }

    pub async fn process_root(
        &mut self,
        root: &PlanNode,
        pack: Option<&IdentityNode>,
    ) -> StoreResult<UploadResultNode> {
        let link = Link {
            is_root: true,
            ..Link::default()
        };
        self.process_node(root, &NodePath::root(), pack, link).await
    }

    /// Commit (running pending deletions first) or roll back
    pub async fn finish(mut self, commit: bool) -> StoreResult<()> {
        if !commit {
            return self.tx.rollback().await;
        }
        for (table, id) in std::mem::take(&mut self.pending_deletes) {
            if let Err(e) = self.tx.delete(&table, id).await {
                self.tx.rollback().await?;
                return Err(e);
            }
            debug!("Deleted {} from '{}'", id, table);
        }
        self.tx.commit().await
    }

    pub async fn abort(self) -> StoreResult<()> {
        self.tx.rollback().await
    }

    pub(super) fn table_def(&self, table: &str) -> StoreResult<&'a TableDef> {
        self.schema
            .table(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    pub(super) fn relationship(
        &self,
        table: &'a TableDef,
        table_name: &str,
        name: &str,
    ) -> StoreResult<&'a RelationshipDef> {
        table.relationships.get(name).ok_or_else(|| {
            StoreError::Backend(format!("'{}' has no relationship '{}'", table_name, name))
        })
    }

    pub(super) async fn process_node(
        &mut self,
        node: &PlanNode,
        path: &NodePath,
        pack: Option<&IdentityNode>,
        link: Link,
    ) -> StoreResult<UploadResultNode> {
        if self.halted {
            return Ok(UploadResultNode::not_attempted(node));
        }
        match node {
            PlanNode::Record(record) => Box::pin(self.process_record(record, path, pack, link)).await,
            PlanNode::Tree(tree) => Box::pin(self.process_tree(tree, path, link)).await,
        }
    }

    pub(super) async fn process_record(
        &mut self,
        node: &RecordNode,
        path: &NodePath,
        pack: Option<&IdentityNode>,
        link: Link,
    ) -> StoreResult<UploadResultNode> {
        let pack_id = pack.and_then(|entry| entry.id);
        if record_is_blank(node, self.row) {
            return match pack_id {
                Some(id) if !link.is_root => self.clear_relationship(node, path, id, &link).await,
                _ => Ok(UploadResultNode::uniform_record(node, &RecordOutcome::NullRecord)),
            };
        }

        let table = self.table_def(&node.table)?;
        let mut result = UploadResultNode::new(&node.table, RecordOutcome::PropagatedFailure);

        let mut fixed = node.static_values.clone();
        fixed.extend(link.inject.clone());

        // Children holding the key this record points at
        let mut blocked = false;
        for (name, child) in &node.to_one {
            let rel = self.relationship(table, &node.table, name)?;
            if rel.fk_side() != FkSide::Owner {
                continue;
            }
            let child_link = Link {
                referrer: pack_id.map(|id| Referrer {
                    table: node.table.clone(),
                    field: rel.field.clone(),
                    id,
                }),
                ..Link::default()
            };
            let child_pack = pack.and_then(|entry| entry.to_one(name));
            let child_result =
                Box::pin(self.process_node(child, &path.to_one(name), child_pack, child_link)).await?;

            if child_result.has_failure() {
                blocked = true;
            } else {
                let value = child_result
                    .record_id()
                    .map(FieldValue::Ref)
                    .unwrap_or(FieldValue::Null);
                fixed.insert(rel.field.clone(), value);
            }
            result.to_one.insert(name.clone(), child_result);
        }

        if blocked || self.halted {
            fill_not_attempted(&mut result, node);
            return Ok(result.settle());
        }

        let bound = match bind_fields(table, &node.fields, self.row) {
            Ok(bound) => bound,
            Err(failures) => {
                result.outcome = RecordOutcome::ParseFailures { failures };
                fill_not_attempted(&mut result, node);
                return Ok(result.settle());
            }
        };

        let request = NodeRequest {
            path,
            table: &node.table,
            on_match: node.on_match,
            identity: &table.identity,
            bound,
            fixed,
            assigned: link.assigned,
            claimed: link.claimed,
            scope: self.scope.node(path),
        };
        let outcome = self.decide(&request, pack).await?;
        debug!("{}: {}", path, outcome.label());
        if outcome.halts_row() {
            self.halted = true;
        }
        let record_id = outcome.record_id();
        result.outcome = outcome;

        let Some(record_id) = record_id else {
            fill_not_attempted(&mut result, node);
            return Ok(result.settle());
        };

        // Children that point back at this record
        for (name, child) in &node.to_one {
            let rel = self.relationship(table, &node.table, name)?;
            if rel.fk_side() != FkSide::Related {
                continue;
            }
            let mut child_link = Link::default();
            child_link
                .inject
                .insert(rel.field.clone(), FieldValue::Ref(record_id));
            let child_pack = pack.and_then(|entry| entry.to_one(name));
            let child_result =
                Box::pin(self.process_node(child, &path.to_one(name), child_pack, child_link)).await?;
            result.to_one.insert(name.clone(), child_result);
        }

        for (name, slots) in &node.to_many {
            let rel = self.relationship(table, &node.table, name)?;
            let results = self
                .resolve_to_many(rel, name, slots, path, pack, record_id)
                .await?;
            result.to_many.insert(name.clone(), results);
        }

        Ok(result.settle())
    }
}

/// Give every child slot without a result a not-attempted subtree
pub(super) fn fill_not_attempted(result: &mut UploadResultNode, node: &RecordNode) {
    for (name, child) in &node.to_one {
        result
            .to_one
            .entry(name.clone())
            .or_insert_with(|| UploadResultNode::not_attempted(child));
    }
    for (name, slots) in &node.to_many {
        result.to_many.entry(name.clone()).or_insert_with(|| {
            slots
                .iter()
                .map(|slot| UploadResultNode::uniform_record(slot, &RecordOutcome::PropagatedFailure))
                .collect()
        });
    }
}
