//! Batch upload driver
//!
//! Scope is resolved once, then every row runs in its own transaction. A row
//! commits only when its whole result tree is free of failures and the batch
//! is in commit mode.

mod matcher;
pub mod ordering;
mod relationships;
mod row;
pub mod rules;
mod tree;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

pub use ordering::{assign_positions, sibling_order};
pub use rules::{BusinessRules, NoRules, PendingWrite, RuleViolation, WriteAction};

use crate::audit::{collect_entries, AuditSink, TracingAuditSink};
use crate::config::{UploadConfig, UploadMode};
use crate::error::{UploadError, UploadResult};
use crate::identity_pack::{IdentityNode, IdentityPack};
use crate::plan::UploadPlan;
use crate::result::{BatchReport, RecordOutcome, RowFailure, RowResult, UploadResultNode};
use crate::schema::Schema;
use crate::scope::{ScopeContext, ScopeResolver};
use crate::source::Row;
use crate::store::RecordStore;
use row::RowContext;

/// Stops a running batch between rows
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Uploader {
    schema: Arc<Schema>,
    plan: Arc<UploadPlan>,
    store: Arc<dyn RecordStore>,
    rules: Arc<dyn BusinessRules>,
    audit: Arc<dyn AuditSink>,
    config: UploadConfig,
    cancel: CancelHandle,
}

impl Uploader {
    pub fn new(
        schema: Arc<Schema>,
        plan: Arc<UploadPlan>,
        store: Arc<dyn RecordStore>,
        config: UploadConfig,
    ) -> Self {
        Self {
            schema,
            plan,
            store,
            rules: Arc::new(NoRules),
            audit: Arc::new(TracingAuditSink),
            config,
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_rules(mut self, rules: Arc<dyn BusinessRules>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Upload a batch. Identity packs, when given, must pair one-to-one with rows.
    pub async fn run(
        &self,
        rows: &[Row],
        packs: Option<&[IdentityPack]>,
    ) -> UploadResult<BatchReport> {
        if let Some(packs) = packs {
            if packs.len() != rows.len() {
                return Err(UploadError::IdentityPackCount {
                    rows: rows.len(),
                    packs: packs.len(),
                });
            }
        }

        info!(
            "Starting upload of {} rows into '{}' ({} mode)",
            rows.len(),
            self.plan.root.table(),
            self.config.mode
        );

        let scope = ScopeResolver::new(&self.schema, &self.config.scope)
            .resolve(&self.plan, self.store.as_ref())
            .await?;

        let mut report = BatchReport::default();
        for (index, row) in rows.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Upload cancelled after {} of {} rows", index, rows.len());
                report.cancelled = true;
                break;
            }

            let pack = packs.map(|packs| &packs[index].root);
            let row_result = self.upload_row(index, row, pack, &scope).await;

            if row_result.committed {
                let entries =
                    collect_entries(index, &row_result.result, &self.config.agent, Utc::now());
                if !entries.is_empty() {
                    self.audit.record(&entries).await;
                }
            }

            let failed = row_result.is_failure();
            report.push(row_result);
            if failed && self.config.stop_on_failed_row {
                warn!("Stopping after failed row {}", index);
                report.cancelled = index + 1 < rows.len();
                break;
            }
        }

        info!(
            "Upload finished: {} rows, {} committed, {} failed",
            report.rows.len(),
            report.committed_rows,
            report.failed_rows
        );
        Ok(report)
    }

    /// Process one row in its own transaction
    pub async fn upload_row(
        &self,
        row_index: usize,
        row: &Row,
        pack: Option<&IdentityNode>,
        scope: &ScopeContext,
    ) -> RowResult {
        let tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => return self.storage_failure(row_index, e.to_string()),
        };
        let mut ctx = RowContext::new(
            tx,
            &self.schema,
            scope,
            self.rules.as_ref(),
            self.config.cleared_relationship_policy,
            row,
        );

        let mut result = match ctx.process_root(&self.plan.root, pack).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(rollback) = ctx.abort().await {
                    warn!("Row {}: rollback failed: {}", row_index, rollback);
                }
                return self.storage_failure(row_index, e.to_string());
            }
        };

        let commit = !result.has_failure() && self.config.mode == UploadMode::Commit;
        if let Err(e) = ctx.finish(commit).await {
            warn!("Row {}: {}", row_index, e);
            result.outcome = RecordOutcome::PropagatedFailure;
            return RowResult {
                row_index,
                result,
                committed: false,
                failure: Some(RowFailure::Storage(e.to_string())),
            };
        }

        debug!(
            "Row {}: {} ({})",
            row_index,
            result.outcome.label(),
            if commit { "committed" } else { "rolled back" }
        );
        RowResult {
            row_index,
            result,
            committed: commit,
            failure: None,
        }
    }

    fn storage_failure(&self, row_index: usize, message: String) -> RowResult {
        warn!("Row {} failed on storage: {}", row_index, message);
        RowResult {
            row_index,
            result: UploadResultNode::not_attempted(&self.plan.root),
            committed: false,
            failure: Some(RowFailure::Storage(message)),
        }
    }
}
