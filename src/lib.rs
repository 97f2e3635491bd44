//! Row Upload - hierarchical record matching and upsert
//!
//! Each input row is mapped through an [`UploadPlan`] onto a graph of related
//! records. Every node of the graph is either matched to an existing record,
//! created, updated or reported as a problem, and each row commits or rolls
//! back as one transaction.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use row_upload::plan::parse_plan_yaml;
//! use row_upload::schema::loader::schema_from_yaml;
//! use row_upload::{InMemoryStore, UploadConfig, Uploader};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let schema = schema_from_yaml(
//!     "tables:\n  agent:\n    fields:\n      last_name: {type: text}\n",
//! )?;
//! let plan = parse_plan_yaml(
//!     &schema,
//!     "version: 1\nroot:\n  record:\n    table: agent\n    fields:\n      last_name: Surname\n",
//! )?;
//! let store = Arc::new(InMemoryStore::new(&schema));
//! let uploader = Uploader::new(Arc::new(schema), Arc::new(plan), store, UploadConfig::default());
//!
//! let rows = row_upload::source::read_csv("Surname\nDarwin\n".as_bytes())?;
//! let report = uploader.run(&rows, None).await?;
//! assert_eq!(report.count("uploaded"), 1);
//! # Ok(())
//! # }
//! ```

// Error handling and configuration
pub mod config;
pub mod error;

// Catalog and plans
pub mod plan;
pub mod schema;
pub mod value;

// Inputs
pub mod binder;
pub mod identity_pack;
pub mod source;

// Engine
pub mod scope;
pub mod upload;

// Storage, results and audit
pub mod audit;
pub mod result;
pub mod store;

pub use audit::{AuditEntry, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::{ClearedRelationshipPolicy, UploadConfig, UploadMode};
pub use error::{UploadError, UploadResult};
pub use identity_pack::{IdentityNode, IdentityPack};
pub use plan::{NodePath, PlanNode, UploadPlan};
pub use result::{BatchReport, ConflictReason, RecordOutcome, RowResult, UploadResultNode};
pub use schema::Schema;
pub use source::Row;
pub use store::{InMemoryStore, RecordStore, StoreTransaction, StoredRecord};
#[cfg(feature = "database")]
pub use store::PgRecordStore;
pub use upload::{BusinessRules, CancelHandle, Uploader};
pub use value::{FieldMap, FieldValue, RecordId};
