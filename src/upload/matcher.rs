//! Match-or-create decisions for a single node
//!
//! Two paths: an identity-pack entry names the record to edit, or candidate
//! records are looked up by identity criteria and the outcome is classified
//! by how many were found.

use std::collections::BTreeSet;

use tracing::debug;

use super::ordering::sibling_order;
use super::row::RowContext;
use super::rules::{PendingWrite, WriteAction};
use crate::binder::BoundValues;
use crate::error::StoreError;
use crate::identity_pack::IdentityNode;
use crate::plan::{MatchBehavior, NodePath, OnMatch};
use crate::result::{ConflictReason, FieldChange, RecordOutcome};
use crate::schema::FkSide;
use crate::scope::NodeScope;
use crate::store::{StoreResult, StoredRecord};
use crate::value::{field_or_null, FieldMap, FieldValue, RecordId};

/// Everything the decider needs about one node of one row
pub(super) struct NodeRequest<'n> {
    pub path: &'n NodePath,
    pub table: &'n str,
    pub on_match: OnMatch,
    /// Lookup fields; empty means every bound field
    pub identity: &'n [String],
    pub bound: BoundValues,
    /// Static values and injected foreign keys: matched on and written
    pub fixed: FieldMap,
    /// Engine-assigned values (sibling positions): written, never matched
    pub assigned: FieldMap,
    /// To-many slots only: sibling ids earlier slots already resolved to
    pub claimed: Option<BTreeSet<RecordId>>,
    pub scope: Option<&'n NodeScope>,
}

impl NodeRequest<'_> {
    /// Fixed values plus the batch scope
    fn anchored(&self) -> FieldMap {
        let mut values = self.fixed.clone();
        if let Some(NodeScope {
            field,
            fixed: Some(id),
            ..
        }) = self.scope
        {
            values.insert(field.clone(), FieldValue::Ref(*id));
        }
        values
    }

    /// Lookup criteria for create-or-match
    fn criteria(&self) -> FieldMap {
        let usable = |behavior: MatchBehavior, value: &FieldValue| match behavior {
            MatchBehavior::IgnoreAlways => false,
            MatchBehavior::IgnoreWhenBlank => !value.is_null(),
            MatchBehavior::IgnoreNever => true,
        };

        let identity: BTreeSet<&str> = self.identity.iter().map(String::as_str).collect();
        let mut criteria: FieldMap = self
            .bound
            .fields
            .iter()
            .filter(|(field, _)| identity.is_empty() || identity.contains(field.as_str()))
            .filter(|(_, bound)| usable(bound.match_behavior, &bound.value))
            .map(|(field, bound)| (field.clone(), bound.value.clone()))
            .collect();

        // Declared identity left blank: fall back to whatever the row did give
        if criteria.is_empty() && !identity.is_empty() {
            criteria = self
                .bound
                .fields
                .iter()
                .filter(|(_, bound)| {
                    bound.match_behavior != MatchBehavior::IgnoreAlways && !bound.value.is_null()
                })
                .map(|(field, bound)| (field.clone(), bound.value.clone()))
                .collect();
        }

        if let Some(scope) = self.scope.filter(|scope| scope.row_variable) {
            if let Some(value) = self.bound.get(&scope.field) {
                criteria.insert(scope.field.clone(), value.clone());
            }
        }
        criteria.extend(self.anchored());
        criteria
    }

    /// Values for a new record
    fn create_values(&self) -> FieldMap {
        let mut values: FieldMap = self
            .bound
            .fields
            .iter()
            .filter(|(_, bound)| !bound.value.is_null())
            .map(|(field, bound)| (field.clone(), bound.value.clone()))
            .collect();
        values.extend(self.anchored());
        values.extend(self.assigned.clone());
        values
    }
}

/// Fields whose proposed value differs from storage
pub(super) fn diff(stored: &FieldMap, proposed: &FieldMap) -> Vec<FieldChange> {
    proposed
        .iter()
        .filter(|(field, after)| field_or_null(stored, field) != *after)
        .map(|(field, after)| FieldChange {
            field: field.clone(),
            before: field_or_null(stored, field).clone(),
            after: after.clone(),
        })
        .collect()
}

fn uniqueness_conflict(id: Option<RecordId>, error: StoreError) -> StoreResult<RecordOutcome> {
    match error {
        StoreError::UniqueViolation { constraint, .. } => Ok(RecordOutcome::Conflict {
            id,
            reason: ConflictReason::Uniqueness { constraint },
        }),
        other => Err(other),
    }
}

impl RowContext<'_> {
    /// Decide a record node: edit in place when the pack names a record,
    /// otherwise create-or-match
    pub(super) async fn decide(
        &mut self,
        request: &NodeRequest<'_>,
        pack: Option<&IdentityNode>,
    ) -> StoreResult<RecordOutcome> {
        match pack.and_then(|entry| entry.id.map(|id| (entry, id))) {
            Some((entry, id)) => self.decide_edit(request, entry, id).await,
            None => self.decide_match(request).await,
        }
    }

    async fn decide_edit(
        &mut self,
        request: &NodeRequest<'_>,
        entry: &IdentityNode,
        id: RecordId,
    ) -> StoreResult<RecordOutcome> {
        let Some(stored) = self.tx.get(request.table, id).await? else {
            return Ok(RecordOutcome::Conflict {
                id: Some(id),
                reason: ConflictReason::Missing,
            });
        };

        if let Some(expected) = entry.version {
            if expected != stored.version {
                return Ok(RecordOutcome::Conflict {
                    id: Some(id),
                    reason: ConflictReason::Version {
                        expected,
                        found: stored.version,
                    },
                });
            }
        }

        if let Some(relationship) = self.stale_empty_marker(request.table, entry, &stored.values) {
            return Ok(RecordOutcome::Conflict {
                id: Some(id),
                reason: ConflictReason::StaleRelationship { relationship },
            });
        }

        let mut proposed = request.bound.values();
        proposed.extend(request.anchored());
        proposed.extend(request.assigned.clone());

        let changes = diff(&stored.values, &proposed);
        if changes.is_empty() {
            return Ok(RecordOutcome::NoChange { id });
        }
        match self.apply_update(request, id, &changes).await? {
            Some(failure) => Ok(failure),
            None => Ok(RecordOutcome::Updated { id, changes }),
        }
    }

    /// A relationship the pack marks empty that storage shows as linked
    fn stale_empty_marker(
        &self,
        table: &str,
        entry: &IdentityNode,
        stored: &FieldMap,
    ) -> Option<String> {
        let table_def = self.schema.table(table)?;
        entry
            .empty
            .iter()
            .find(|name| {
                table_def.relationships.get(*name).is_some_and(|rel| {
                    rel.fk_side() == FkSide::Owner && !field_or_null(stored, &rel.field).is_null()
                })
            })
            .cloned()
    }

    pub(super) async fn decide_match(
        &mut self,
        request: &NodeRequest<'_>,
    ) -> StoreResult<RecordOutcome> {
        let criteria = self.criteria_or_empty(request);
        let mut candidates = match &criteria {
            Some(criteria) => self.tx.find(request.table, criteria).await?,
            None => Vec::new(),
        };
        if let Some(claimed) = &request.claimed {
            candidates.retain(|record| !claimed.contains(&record.id));
            if candidates.len() > 1 {
                candidates = self.first_sibling(request.table, candidates);
            }
        }
        debug!(
            "{}: {} candidate(s) in '{}'",
            request.path,
            candidates.len(),
            request.table
        );

        match candidates.len() {
            0 => {
                let values = request.create_values();
                self.apply_insert(request, &values).await
            }
            1 => {
                let record = candidates.remove(0);
                let criteria = criteria.unwrap_or_default();
                let mut compared: FieldMap = request
                    .bound
                    .fields
                    .iter()
                    .filter(|(field, bound)| {
                        !criteria.contains_key(field.as_str()) && !bound.value.is_null()
                    })
                    .map(|(field, bound)| (field.clone(), bound.value.clone()))
                    .collect();
                compared.extend(request.assigned.clone());

                let changes = diff(&record.values, &compared);
                if changes.is_empty() || request.on_match == OnMatch::Ignore {
                    return Ok(RecordOutcome::Matched { id: record.id });
                }
                match self.apply_update(request, record.id, &changes).await? {
                    Some(failure) => Ok(failure),
                    None => Ok(RecordOutcome::MatchedAndChanged {
                        id: record.id,
                        changes,
                    }),
                }
            }
            _ => {
                let mut ids: Vec<RecordId> = candidates.iter().map(|r| r.id).collect();
                ids.sort();
                Ok(RecordOutcome::MatchedMultiple { candidates: ids })
            }
        }
    }

    /// Unclaimed siblings equal on every criterion are interchangeable:
    /// take the first in display order
    fn first_sibling(&self, table: &str, candidates: Vec<StoredRecord>) -> Vec<StoredRecord> {
        let ordering = self
            .schema
            .table(table)
            .and_then(|def| def.ordering_field.as_deref())
            .unwrap_or_default();
        let first = sibling_order(&candidates, ordering).into_iter().next();
        candidates
            .into_iter()
            .filter(|record| Some(record.id) == first)
            .collect()
    }

    /// None when there is nothing to look up by, so the node is always new
    fn criteria_or_empty(&self, request: &NodeRequest<'_>) -> Option<FieldMap> {
        let criteria = request.criteria();
        (!criteria.is_empty()).then_some(criteria)
    }

    /// Create a record after the rule check. Returns the node outcome.
    async fn apply_insert(
        &mut self,
        request: &NodeRequest<'_>,
        values: &FieldMap,
    ) -> StoreResult<RecordOutcome> {
        let write = PendingWrite {
            path: request.path,
            table: request.table,
            action: WriteAction::Create,
            id: None,
            values,
        };
        if let Err(violation) = self.rules.check(write).await {
            return Ok(RecordOutcome::FailedBusinessRule {
                rule: violation.rule,
                message: violation.message,
            });
        }
        match self.tx.insert(request.table, values).await {
            Ok(record) => Ok(RecordOutcome::Uploaded { id: record.id }),
            Err(e) => uniqueness_conflict(None, e),
        }
    }

    /// Update a record after the rule check. Returns a failure outcome, if any.
    async fn apply_update(
        &mut self,
        request: &NodeRequest<'_>,
        id: RecordId,
        changes: &[FieldChange],
    ) -> StoreResult<Option<RecordOutcome>> {
        let values: FieldMap = changes
            .iter()
            .map(|change| (change.field.clone(), change.after.clone()))
            .collect();
        let write = PendingWrite {
            path: request.path,
            table: request.table,
            action: WriteAction::Update,
            id: Some(id),
            values: &values,
        };
        if let Err(violation) = self.rules.check(write).await {
            return Ok(Some(RecordOutcome::FailedBusinessRule {
                rule: violation.rule,
                message: violation.message,
            }));
        }
        match self.tx.update(request.table, id, &values).await {
            Ok(_) => Ok(None),
            Err(e) => uniqueness_conflict(Some(id), e).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::BoundField;

    fn bound(pairs: &[(&str, FieldValue, MatchBehavior)]) -> BoundValues {
        BoundValues {
            fields: pairs
                .iter()
                .map(|(field, value, behavior)| {
                    (
                        field.to_string(),
                        BoundField {
                            value: value.clone(),
                            match_behavior: *behavior,
                        },
                    )
                })
                .collect(),
        }
    }

    fn request<'n>(path: &'n NodePath, identity: &'n [String], values: BoundValues) -> NodeRequest<'n> {
        NodeRequest {
            path,
            table: "agent",
            on_match: OnMatch::Ignore,
            identity,
            bound: values,
            fixed: FieldMap::new(),
            assigned: FieldMap::new(),
            claimed: None,
            scope: None,
        }
    }

    #[test]
    fn criteria_honour_match_behavior() {
        let path = NodePath::root();
        let values = bound(&[
            ("last_name", "Darwin".into(), MatchBehavior::IgnoreWhenBlank),
            ("first_name", FieldValue::Null, MatchBehavior::IgnoreWhenBlank),
            ("middle", FieldValue::Null, MatchBehavior::IgnoreNever),
            ("remarks", "naturalist".into(), MatchBehavior::IgnoreAlways),
        ]);
        let criteria = request(&path, &[], values).criteria();

        assert_eq!(criteria.len(), 2);
        assert_eq!(criteria["last_name"], FieldValue::from("Darwin"));
        assert!(criteria["middle"].is_null());
    }

    #[test]
    fn declared_identity_limits_criteria() {
        let path = NodePath::root();
        let identity = vec!["last_name".to_string()];
        let values = bound(&[
            ("last_name", "Darwin".into(), MatchBehavior::IgnoreWhenBlank),
            ("first_name", "Charles".into(), MatchBehavior::IgnoreWhenBlank),
        ]);
        let criteria = request(&path, &identity, values).criteria();
        assert_eq!(criteria.keys().collect::<Vec<_>>(), vec!["last_name"]);
    }

    #[test]
    fn blank_identity_falls_back_to_given_values() {
        let path = NodePath::root();
        let identity = vec!["last_name".to_string()];
        let values = bound(&[
            ("last_name", FieldValue::Null, MatchBehavior::IgnoreWhenBlank),
            ("first_name", "Charles".into(), MatchBehavior::IgnoreWhenBlank),
        ]);
        let criteria = request(&path, &identity, values).criteria();
        assert_eq!(criteria.keys().collect::<Vec<_>>(), vec!["first_name"]);
    }

    #[test]
    fn fixed_scope_joins_criteria_and_created_values() {
        let path = NodePath::root();
        let scope_id = RecordId::new();
        let scope = NodeScope {
            field: "collection".into(),
            scope_table: "collection".into(),
            fixed: Some(scope_id),
            row_variable: false,
        };
        let mut req = request(
            &path,
            &[],
            bound(&[("last_name", "Darwin".into(), MatchBehavior::IgnoreWhenBlank)]),
        );
        req.scope = Some(&scope);
        req.assigned.insert("ordinal".into(), FieldValue::Integer(2));

        assert_eq!(req.criteria()["collection"], FieldValue::Ref(scope_id));
        assert!(!req.criteria().contains_key("ordinal"));
        let created = req.create_values();
        assert_eq!(created["collection"], FieldValue::Ref(scope_id));
        assert_eq!(created["ordinal"], FieldValue::Integer(2));
    }

    #[test]
    fn diff_reports_before_and_after() {
        let mut stored = FieldMap::new();
        stored.insert("name".into(), "Quercus".into());
        let mut proposed = FieldMap::new();
        proposed.insert("name".into(), "Quercus".into());
        proposed.insert("author".into(), "L.".into());

        let changes = diff(&stored, &proposed);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "author");
        assert!(changes[0].before.is_null());
    }
}
