//! Audit trail
//!
//! After a row commits, every `Updated` and `MatchedAndChanged` outcome in
//! its result tree (tree ranks included) becomes one entry per physical
//! record, listing the changed fields with their before and after values.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::result::{FieldChange, UploadResultNode};
use crate::value::RecordId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub row_index: usize,
    pub table: String,
    pub record_id: RecordId,
    pub changes: Vec<FieldChange>,
    /// Acting identity
    pub agent: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn changed_fields(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.field.as_str()).collect()
    }
}

/// Destination for audit entries
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entries: &[AuditEntry]);
}

/// Build the audit entries of one committed row
pub fn collect_entries(
    row_index: usize,
    result: &UploadResultNode,
    agent: &str,
    timestamp: DateTime<Utc>,
) -> Vec<AuditEntry> {
    // (table, id) -> field -> change; the first before and the last after win
    let mut merged: BTreeMap<(String, RecordId), BTreeMap<String, FieldChange>> = BTreeMap::new();
    result.for_each_outcome(&mut |table, outcome| {
        let (Some(id), changes) = (outcome.record_id(), outcome.changes()) else {
            return;
        };
        if changes.is_empty() {
            return;
        }
        let fields = merged.entry((table.to_string(), id)).or_default();
        for change in changes {
            fields
                .entry(change.field.clone())
                .and_modify(|existing| existing.after = change.after.clone())
                .or_insert_with(|| change.clone());
        }
    });

    merged
        .into_iter()
        .map(|((table, record_id), fields)| AuditEntry {
            row_index,
            table,
            record_id,
            changes: fields.into_values().collect(),
            agent: agent.to_string(),
            timestamp,
        })
        .collect()
}

/// Keeps entries in memory
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entries: &[AuditEntry]) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(entries);
    }
}

/// Writes entries as structured log events
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entries: &[AuditEntry]) {
        for entry in entries {
            info!(
                row = entry.row_index,
                table = %entry.table,
                record_id = %entry.record_id,
                agent = %entry.agent,
                fields = ?entry.changed_fields(),
                "audit"
            );
        }
    }
}
