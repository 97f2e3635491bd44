//! Business-rule hook
//!
//! Consulted before every write. A violation fails the node with
//! `FailedBusinessRule` and halts the row.

use async_trait::async_trait;

use crate::plan::NodePath;
use crate::value::{FieldMap, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

/// The write about to happen
#[derive(Debug, Clone, Copy)]
pub struct PendingWrite<'a> {
    pub path: &'a NodePath,
    pub table: &'a str,
    pub action: WriteAction,
    pub id: Option<RecordId>,
    /// Full values for creates, changed fields for updates, empty for deletes
    pub values: &'a FieldMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    pub rule: String,
    pub message: String,
}

#[async_trait]
pub trait BusinessRules: Send + Sync {
    async fn check(&self, write: PendingWrite<'_>) -> Result<(), RuleViolation>;
}

/// Accepts every write
pub struct NoRules;

#[async_trait]
impl BusinessRules for NoRules {
    async fn check(&self, _write: PendingWrite<'_>) -> Result<(), RuleViolation> {
        Ok(())
    }
}
