//! Batch scope resolution
//!
//! Tables may carry a scope field pointing at a tenant/organizational record.
//! Before any row runs, every plan node of a scoped table is classified: either
//! its scope comes from row data (row-variable) or it is the same for the
//! whole batch, in which case the value is verified once and cached here.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use crate::error::ScopeError;
use crate::plan::{NodePath, PlanNode, RecordNode, UploadPlan};
use crate::schema::{FkSide, Schema, ScopeDef};
use crate::store::RecordStore;
use crate::value::{FieldValue, RecordId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeScope {
    /// Scope field on the node's table
    pub field: String,
    pub scope_table: String,
    /// Set when the scope is fixed for the batch
    pub fixed: Option<RecordId>,
    pub row_variable: bool,
}

/// Read-only scope cache for one batch, keyed by node path
#[derive(Debug, Clone, Default)]
pub struct ScopeContext {
    nodes: HashMap<NodePath, NodeScope>,
}

impl ScopeContext {
    pub fn node(&self, path: &NodePath) -> Option<&NodeScope> {
        self.nodes.get(path)
    }

    /// Whether the node's scope must be derived per row
    pub fn is_variable(&self, path: &NodePath) -> bool {
        self.nodes
            .get(path)
            .map(|scope| scope.row_variable)
            .unwrap_or(false)
    }

    /// The batch-fixed scope field and value of a node, if any
    pub fn fixed(&self, path: &NodePath) -> Option<(&str, RecordId)> {
        self.nodes
            .get(path)
            .and_then(|scope| scope.fixed.map(|id| (scope.field.as_str(), id)))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct ScopeResolver<'a> {
    schema: &'a Schema,
    /// Scope table -> configured record id
    batch_scope: &'a BTreeMap<String, String>,
}

impl<'a> ScopeResolver<'a> {
    pub fn new(schema: &'a Schema, batch_scope: &'a BTreeMap<String, String>) -> Self {
        Self {
            schema,
            batch_scope,
        }
    }

    /// Classify every scoped node and verify each distinct fixed value once
    pub async fn resolve(
        &self,
        plan: &UploadPlan,
        store: &dyn RecordStore,
    ) -> Result<ScopeContext, ScopeError> {
        let mut context = ScopeContext::default();
        self.visit(&plan.root, &NodePath::root(), &mut context)?;

        // (scope table, id) -> first node that uses it
        let mut to_verify: BTreeMap<(String, RecordId), NodePath> = BTreeMap::new();
        for (path, scope) in &context.nodes {
            if let Some(id) = scope.fixed {
                to_verify
                    .entry((scope.scope_table.clone(), id))
                    .and_modify(|first| {
                        if path < first {
                            *first = path.clone();
                        }
                    })
                    .or_insert_with(|| path.clone());
            }
        }

        if !to_verify.is_empty() {
            let mut tx = store.begin().await?;
            for ((scope_table, id), path) in &to_verify {
                let found = tx.get(scope_table, *id).await;
                let found = match found {
                    Ok(found) => found,
                    Err(e) => {
                        tx.rollback().await?;
                        return Err(e.into());
                    }
                };
                if found.is_none() {
                    tx.rollback().await?;
                    return Err(ScopeError::NotFound {
                        path: path.to_string(),
                        scope_table: scope_table.clone(),
                        id: *id,
                    });
                }
                debug!("Verified scope {} in '{}'", id, scope_table);
            }
            tx.rollback().await?;
        }

        info!(
            "Resolved scope for {} nodes ({} row-variable, {} distinct fixed values)",
            context.len(),
            context.nodes.values().filter(|s| s.row_variable).count(),
            to_verify.len()
        );
        Ok(context)
    }

    fn visit(
        &self,
        node: &PlanNode,
        path: &NodePath,
        context: &mut ScopeContext,
    ) -> Result<(), ScopeError> {
        match node {
            PlanNode::Record(record) => self.visit_record(record, path, context),
            PlanNode::Tree(tree) => {
                let Some(scope) = self.scope_of(&tree.table) else {
                    return Ok(());
                };
                let row_variable = tree
                    .ranks
                    .iter()
                    .any(|rank| rank.fields.contains_key(&scope.field));
                let fixed = if row_variable {
                    None
                } else {
                    Some(self.batch_value(scope, path)?)
                };
                context.nodes.insert(
                    path.clone(),
                    NodeScope {
                        field: scope.field.clone(),
                        scope_table: scope.table.clone(),
                        fixed,
                        row_variable,
                    },
                );
                Ok(())
            }
        }
    }

    fn visit_record(
        &self,
        record: &RecordNode,
        path: &NodePath,
        context: &mut ScopeContext,
    ) -> Result<(), ScopeError> {
        if let Some(scope) = self.scope_of(&record.table) {
            let node_scope = self.classify_record(record, scope, path)?;
            context.nodes.insert(path.clone(), node_scope);
        }
        for (name, child) in &record.to_one {
            self.visit(child, &path.to_one(name), context)?;
        }
        for (name, slots) in &record.to_many {
            for (index, slot) in slots.iter().enumerate() {
                self.visit_record(slot, &path.to_many(name, index), context)?;
            }
        }
        Ok(())
    }

    fn classify_record(
        &self,
        record: &RecordNode,
        scope: &ScopeDef,
        path: &NodePath,
    ) -> Result<NodeScope, ScopeError> {
        let filled_by_child = self
            .schema
            .table(&record.table)
            .map(|table| {
                record.to_one.keys().any(|name| {
                    table.relationships.get(name).is_some_and(|rel| {
                        rel.fk_side() == FkSide::Owner && rel.field == scope.field
                    })
                })
            })
            .unwrap_or(false);

        let row_variable = record.fields.contains_key(&scope.field) || filled_by_child;
        let fixed = if row_variable {
            None
        } else {
            match record.static_values.get(&scope.field) {
                Some(FieldValue::Ref(id)) => Some(*id),
                Some(_) => {
                    return Err(ScopeError::Unresolved {
                        path: path.to_string(),
                        scope_table: scope.table.clone(),
                    })
                }
                None => Some(self.batch_value(scope, path)?),
            }
        };

        Ok(NodeScope {
            field: scope.field.clone(),
            scope_table: scope.table.clone(),
            fixed,
            row_variable,
        })
    }

    fn scope_of(&self, table: &str) -> Option<&'a ScopeDef> {
        self.schema.table(table).and_then(|t| t.scope.as_ref())
    }

    fn batch_value(&self, scope: &ScopeDef, path: &NodePath) -> Result<RecordId, ScopeError> {
        let value = self
            .batch_scope
            .get(&scope.table)
            .ok_or_else(|| ScopeError::Unresolved {
                path: path.to_string(),
                scope_table: scope.table.clone(),
            })?;
        value.trim().parse().map_err(|_| ScopeError::InvalidValue {
            scope_table: scope.table.clone(),
            value: value.clone(),
        })
    }
}
