//! In-memory record store
//!
//! Transactions take the store lock for their whole lifetime and work on a
//! copy of the data, so rows are fully isolated and a rollback is simply
//! dropping the copy. Unique constraints from the schema are enforced with
//! SQL semantics (a null never conflicts).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{RecordStore, StoreResult, StoreTransaction, StoredRecord};
use crate::error::StoreError;
use crate::schema::Schema;
use crate::value::{field_or_null, FieldMap, RecordId};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// Records per table in insertion order
    tables: BTreeMap<String, Vec<StoredRecord>>,
}

type UniqueConstraints = BTreeMap<String, Vec<Vec<String>>>;

/// Store backed by process memory
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    unique: Arc<UniqueConstraints>,
}

impl InMemoryStore {
    /// Create an empty store with one table per schema table
    pub fn new(schema: &Schema) -> Self {
        let tables = schema
            .tables
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        let unique = schema
            .tables
            .iter()
            .filter(|(_, table)| !table.unique.is_empty())
            .map(|(name, table)| (name.clone(), table.unique.clone()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(MemoryState { tables })),
            unique: Arc::new(unique),
        }
    }

    /// Insert and commit a record directly (fixtures, scope records)
    pub async fn seed(&self, table: &str, values: FieldMap) -> StoreResult<RecordId> {
        let mut state = self.state.lock().await;
        let record = insert_into(&mut state, &self.unique, table, &values)?;
        Ok(record.id)
    }

    /// Committed records of a table in storage order
    pub async fn records(&self, table: &str) -> Vec<StoredRecord> {
        let state = self.state.lock().await;
        state.tables.get(table).cloned().unwrap_or_default()
    }

    pub async fn count(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state.tables.get(table).map(Vec::len).unwrap_or(0)
    }

    pub async fn record(&self, table: &str, id: RecordId) -> Option<StoredRecord> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned())
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            unique: self.unique.clone(),
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    unique: Arc<UniqueConstraints>,
}

fn table_mut<'a>(state: &'a mut MemoryState, table: &str) -> StoreResult<&'a mut Vec<StoredRecord>> {
    state
        .tables
        .get_mut(table)
        .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
}

fn without_nulls(values: &FieldMap) -> FieldMap {
    values
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn check_unique(
    records: &[StoredRecord],
    unique: &UniqueConstraints,
    table: &str,
    id: RecordId,
    values: &FieldMap,
) -> StoreResult<()> {
    let Some(constraints) = unique.get(table) else {
        return Ok(());
    };
    for fields in constraints {
        if fields.iter().any(|f| field_or_null(values, f).is_null()) {
            continue;
        }
        let clash = records.iter().any(|other| {
            other.id != id
                && fields
                    .iter()
                    .all(|f| field_or_null(&other.values, f) == field_or_null(values, f))
        });
        if clash {
            return Err(StoreError::UniqueViolation {
                table: table.to_string(),
                constraint: format!("{}_{}_key", table, fields.join("_")),
            });
        }
    }
    Ok(())
}

fn insert_into(
    state: &mut MemoryState,
    unique: &UniqueConstraints,
    table: &str,
    values: &FieldMap,
) -> StoreResult<StoredRecord> {
    let records = table_mut(state, table)?;
    let record = StoredRecord {
        id: RecordId::new(),
        version: 1,
        values: without_nulls(values),
    };
    check_unique(records, unique, table, record.id, &record.values)?;
    records.push(record.clone());
    Ok(record)
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find(&mut self, table: &str, criteria: &FieldMap) -> StoreResult<Vec<StoredRecord>> {
        let records = table_mut(&mut self.working, table)?;
        Ok(records
            .iter()
            .filter(|record| {
                criteria
                    .iter()
                    .all(|(field, value)| field_or_null(&record.values, field) == value)
            })
            .cloned()
            .collect())
    }

    async fn get(&mut self, table: &str, id: RecordId) -> StoreResult<Option<StoredRecord>> {
        let records = table_mut(&mut self.working, table)?;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn insert(&mut self, table: &str, values: &FieldMap) -> StoreResult<StoredRecord> {
        insert_into(&mut self.working, &self.unique, table, values)
    }

    async fn update(
        &mut self,
        table: &str,
        id: RecordId,
        changes: &FieldMap,
    ) -> StoreResult<StoredRecord> {
        let records = table_mut(&mut self.working, table)?;
        let position = records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id,
            })?;

        let mut values = records[position].values.clone();
        for (field, value) in changes {
            if value.is_null() {
                values.remove(field);
            } else {
                values.insert(field.clone(), value.clone());
            }
        }
        check_unique(records, &self.unique, table, id, &values)?;

        let record = &mut records[position];
        record.values = values;
        record.version += 1;
        Ok(record.clone())
    }

    async fn delete(&mut self, table: &str, id: RecordId) -> StoreResult<()> {
        let records = table_mut(&mut self.working, table)?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id,
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
