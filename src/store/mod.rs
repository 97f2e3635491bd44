//! Storage port traits
//!
//! The engine depends only on these traits. `InMemoryStore` gives the
//! reference semantics (tests, validation runs); `PgRecordStore` (feature
//! `database`) targets PostgreSQL.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryStore;
#[cfg(feature = "database")]
pub use postgres::PgRecordStore;

use crate::error::StoreError;
use crate::value::{FieldMap, RecordId};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A record as currently held by storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: RecordId,
    /// Incremented by every update
    pub version: i64,
    /// Null fields may be absent
    pub values: FieldMap,
}

/// Entry point of a relational store
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Open a transaction. Everything one row does happens inside one.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// Operations available inside a transaction
#[async_trait]
pub trait StoreTransaction: Send {
    /// Records whose fields equal every criterion, in storage order.
    /// A null criterion matches null or absent fields.
    async fn find(&mut self, table: &str, criteria: &FieldMap) -> StoreResult<Vec<StoredRecord>>;

    /// Load a record by ID
    async fn get(&mut self, table: &str, id: RecordId) -> StoreResult<Option<StoredRecord>>;

    /// Create a record with a fresh ID at version 1
    async fn insert(&mut self, table: &str, values: &FieldMap) -> StoreResult<StoredRecord>;

    /// Apply field changes and increment the version
    async fn update(
        &mut self,
        table: &str,
        id: RecordId,
        changes: &FieldMap,
    ) -> StoreResult<StoredRecord>;

    async fn delete(&mut self, table: &str, id: RecordId) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
