//! Shared fixtures for the upload scenario tests
//!
//! A small natural-history catalog: specimens with a cataloger, a locality,
//! a taxon tree and ordered preparations.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;

use row_upload::error::StoreError;
use row_upload::plan::parse_plan_yaml;
use row_upload::schema::loader::schema_from_yaml;
use row_upload::store::StoreResult;
use row_upload::upload::{BusinessRules, PendingWrite, RuleViolation, WriteAction};
use row_upload::{
    FieldMap, FieldValue, InMemoryStore, RecordId, RecordStore, Row, Schema, StoreTransaction,
    StoredRecord, UploadConfig, UploadPlan, Uploader,
};

pub const CATALOG: &str = r#"
tables:
  institution:
    fields:
      name: {type: text}
  agent:
    identity: [first_name, last_name]
    fields:
      first_name: {type: text}
      last_name: {type: text}
      title: {type: text}
  locality:
    fields:
      name: {type: text}
      country: {type: text}
  specimen:
    identity: [catalog_number]
    unique: [[catalog_number]]
    fields:
      catalog_number: {type: text, required: true}
      remarks: {type: text}
      collected: {type: date}
      count: {type: integer}
      weight: {type: decimal}
      verified: {type: boolean}
      attributes: {type: json}
      cataloger_id: {type: ref}
      locality_id: {type: ref}
      taxon_id: {type: ref}
    relationships:
      cataloger: {kind: to_one, target: agent, field: cataloger_id}
      locality: {kind: to_one, target: locality, field: locality_id}
      taxon: {kind: to_one, target: taxon, field: taxon_id}
      preparations: {kind: to_many, target: preparation, field: specimen_id}
  preparation:
    ordering_field: position
    fields:
      kind: {type: text}
      position: {type: integer}
      specimen_id: {type: ref}
  taxon:
    fields:
      name: {type: text}
      rank: {type: text}
      parent_id: {type: ref}
    tree:
      ranks: [Kingdom, Phylum, Class]
      name_field: name
      rank_field: rank
      parent_field: parent_id
  collector:
    scope: {field: institution_id, table: institution}
    fields:
      name: {type: text}
      institution_id: {type: ref}
  loan:
    identity: [number]
    scope: {field: institution_id, table: institution}
    fields:
      number: {type: text}
      institution_id: {type: ref}
"#;

pub const AGENT_PLAN: &str = r#"
version: 1
root:
  record:
    table: agent
    fields:
      first_name: First
      last_name: Last
      title: Title
"#;

pub const SPECIMEN_PLAN: &str = r#"
version: 1
root:
  record:
    table: specimen
    fields:
      catalog_number: Catalog
      remarks: Remarks
    to_one:
      cataloger:
        record:
          table: agent
          fields:
            first_name: Cataloger First
            last_name: Cataloger Last
      locality:
        record:
          table: locality
          fields:
            name: Locality
      taxon:
        tree:
          table: taxon
          ranks:
            - {rank: Kingdom, fields: {name: Kingdom}}
            - {rank: Phylum, fields: {name: Phylum}}
            - {rank: Class, fields: {name: Class}}
    to_many:
      preparations:
        - record: {table: preparation, fields: {kind: Prep 1}}
        - record: {table: preparation, fields: {kind: Prep 2}}
"#;

pub const LOCALITY_PLAN: &str = r#"
version: 1
root:
  record:
    table: specimen
    fields:
      catalog_number: Catalog
    to_one:
      locality:
        record:
          table: locality
          fields:
            name: Locality
"#;

pub const PREPARATION_PLAN: &str = r#"
version: 1
root:
  record:
    table: specimen
    fields:
      catalog_number: Catalog
    to_many:
      preparations:
        - record: {table: preparation, fields: {kind: Prep 1, position: Prep 1 Position}}
        - record: {table: preparation, fields: {kind: Prep 2, position: Prep 2 Position}}
        - record: {table: preparation, fields: {kind: Prep 3, position: Prep 3 Position}}
"#;

pub const TAXON_PLAN: &str = r#"
version: 1
root:
  tree:
    table: taxon
    ranks:
      - {rank: Kingdom, fields: {name: Kingdom}}
      - {rank: Phylum, fields: {name: Phylum}}
      - {rank: Class, fields: {name: Class}}
"#;

pub const COLLECTOR_PLAN: &str = r#"
version: 1
root:
  record:
    table: collector
    fields:
      name: Collector
"#;

pub const LOAN_PLAN: &str = r#"
version: 1
root:
  record:
    table: loan
    fields:
      number: Loan
      institution_id: Institution
"#;

pub fn schema() -> Arc<Schema> {
    Arc::new(schema_from_yaml(CATALOG).expect("fixture catalog is valid"))
}

pub fn plan(schema: &Schema, yaml: &str) -> Arc<UploadPlan> {
    Arc::new(parse_plan_yaml(schema, yaml).expect("fixture plan is valid"))
}

pub fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(column, value)| (column.to_string(), value.to_string()))
        .collect()
}

pub fn values(pairs: &[(&str, FieldValue)]) -> FieldMap {
    pairs
        .iter()
        .map(|(field, value)| (field.to_string(), value.clone()))
        .collect()
}

pub fn text(s: &str) -> FieldValue {
    FieldValue::Text(s.to_string())
}

/// A fresh store and an uploader over it
pub fn setup(plan_yaml: &str, config: UploadConfig) -> (InMemoryStore, Uploader) {
    let schema = schema();
    let plan = plan(&schema, plan_yaml);
    let store = InMemoryStore::new(&schema);
    let uploader = Uploader::new(schema, plan, Arc::new(store.clone()), config);
    (store, uploader)
}

pub async fn seed_agent(store: &InMemoryStore, first: &str, last: &str, title: &str) -> RecordId {
    store
        .seed(
            "agent",
            values(&[
                ("first_name", text(first)),
                ("last_name", text(last)),
                ("title", text(title)),
            ]),
        )
        .await
        .expect("seed agent")
}

// ============================================================================
// Store that fails on demand
// ============================================================================

/// Delegates to an in-memory store but fails every insert into one table
pub struct FailingStore {
    pub inner: InMemoryStore,
    pub fail_on: String,
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(FailingTransaction {
            inner: self.inner.begin().await?,
            fail_on: self.fail_on.clone(),
        }))
    }
}

struct FailingTransaction {
    inner: Box<dyn StoreTransaction>,
    fail_on: String,
}

#[async_trait]
impl StoreTransaction for FailingTransaction {
    async fn find(&mut self, table: &str, criteria: &FieldMap) -> StoreResult<Vec<StoredRecord>> {
        self.inner.find(table, criteria).await
    }

    async fn get(&mut self, table: &str, id: RecordId) -> StoreResult<Option<StoredRecord>> {
        self.inner.get(table, id).await
    }

    async fn insert(&mut self, table: &str, values: &FieldMap) -> StoreResult<StoredRecord> {
        if table == self.fail_on {
            return Err(StoreError::Connection("connection reset by peer".to_string()));
        }
        self.inner.insert(table, values).await
    }

    async fn update(
        &mut self,
        table: &str,
        id: RecordId,
        changes: &FieldMap,
    ) -> StoreResult<StoredRecord> {
        self.inner.update(table, id, changes).await
    }

    async fn delete(&mut self, table: &str, id: RecordId) -> StoreResult<()> {
        self.inner.delete(table, id).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.inner.rollback().await
    }
}

// ============================================================================
// Business rules
// ============================================================================

/// Vetoes one kind of write on one table
pub struct Veto {
    pub table: &'static str,
    pub action: WriteAction,
}

#[async_trait]
impl BusinessRules for Veto {
    async fn check(&self, write: PendingWrite<'_>) -> Result<(), RuleViolation> {
        if write.table == self.table && write.action == self.action {
            return Err(RuleViolation {
                rule: format!("no-{}", self.table),
                message: format!("{:?} on '{}' is not allowed", self.action, self.table),
            });
        }
        Ok(())
    }
}
