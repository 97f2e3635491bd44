//! PostgreSQL record store
//!
//! One table per schema table with `id uuid`, `version bigint` and an
//! identity `seq` column giving storage order. Rows are decoded through
//! `to_jsonb` using the field types from the schema.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use super::{RecordStore, StoreResult, StoreTransaction, StoredRecord};
use crate::error::StoreError;
use crate::schema::{FieldType, Schema, TableDef};
use crate::value::{FieldMap, FieldValue, RecordId};

pub struct PgRecordStore {
    pool: PgPool,
    schema: Arc<Schema>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, schema: Arc<Schema>) -> Self {
        Self { pool, schema }
    }

    pub async fn connect(database_url: &str, schema: Arc<Schema>) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info!("Connected to PostgreSQL record store");
        Ok(Self::new(pool, schema))
    }

    /// Create missing tables and unique indexes for every schema table
    pub async fn ensure_tables(&self) -> StoreResult<()> {
        for (name, table) in &self.schema.tables {
            let mut columns = vec![
                "id uuid PRIMARY KEY".to_string(),
                "version bigint NOT NULL DEFAULT 1".to_string(),
                "seq bigint GENERATED ALWAYS AS IDENTITY".to_string(),
            ];
            for (field, def) in &table.fields {
                columns.push(format!("{} {}", quote(field), sql_type(def.field_type)));
            }
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote(name),
                columns.join(", ")
            );
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| map_error(name, e))?;

            for constraint in &table.unique {
                let index = format!("{}_{}_key", name, constraint.join("_"));
                let fields: Vec<String> = constraint.iter().map(|f| quote(f)).collect();
                let ddl = format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote(&index),
                    quote(name),
                    fields.join(", ")
                );
                sqlx::query(&ddl)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_error(name, e))?;
            }
        }
        info!("Ensured {} tables", self.schema.tables.len());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Box::new(PgTransaction {
            tx,
            schema: self.schema.clone(),
        }))
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
    schema: Arc<Schema>,
}

impl PgTransaction {
    fn table(&self, table: &str) -> StoreResult<&TableDef> {
        self.schema
            .table(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    fn decode(&self, table: &str, row: &sqlx::postgres::PgRow) -> StoreResult<StoredRecord> {
        let def = self.table(table)?;
        let id: Uuid = row.try_get("id").map_err(|e| map_error(table, e))?;
        let version: i64 = row.try_get("version").map_err(|e| map_error(table, e))?;
        let doc: serde_json::Value = row.try_get("doc").map_err(|e| map_error(table, e))?;

        let mut values = FieldMap::new();
        for (field, field_def) in &def.fields {
            let Some(json) = doc.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let value = field_def
                .field_type
                .value_from_json(json)
                .map_err(|message| StoreError::Backend(format!("{}.{}: {}", table, field, message)))?;
            values.insert(field.clone(), value);
        }
        Ok(StoredRecord {
            id: RecordId::from_uuid(id),
            version,
            values,
        })
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn find(&mut self, table: &str, criteria: &FieldMap) -> StoreResult<Vec<StoredRecord>> {
        self.table(table)?;
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT t.id, t.version, to_jsonb(t) AS doc FROM {} t WHERE TRUE",
            quote(table)
        ));
        for (field, value) in criteria {
            qb.push(format!(" AND t.{}", quote(field)));
            if value.is_null() {
                qb.push(" IS NULL");
            } else {
                qb.push(" = ");
                push_value(&mut qb, value);
            }
        }
        qb.push(" ORDER BY t.seq");

        let rows = qb
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_error(table, e))?;
        rows.iter().map(|row| self.decode(table, row)).collect()
    }

    async fn get(&mut self, table: &str, id: RecordId) -> StoreResult<Option<StoredRecord>> {
        self.table(table)?;
        let sql = format!(
            "SELECT t.id, t.version, to_jsonb(t) AS doc FROM {} t WHERE t.id = $1",
            quote(table)
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_error(table, e))?;
        row.map(|row| self.decode(table, &row)).transpose()
    }

    async fn insert(&mut self, table: &str, values: &FieldMap) -> StoreResult<StoredRecord> {
        self.table(table)?;
        let present: Vec<(&String, &FieldValue)> =
            values.iter().filter(|(_, v)| !v.is_null()).collect();

        let mut qb = QueryBuilder::<Postgres>::new(format!("INSERT INTO {} AS t (id, version", quote(table)));
        for (field, _) in &present {
            qb.push(format!(", {}", quote(field)));
        }
        qb.push(") VALUES (");
        qb.push_bind(Uuid::new_v4());
        qb.push(", 1");
        for (_, value) in &present {
            qb.push(", ");
            push_value(&mut qb, value);
        }
        qb.push(") RETURNING t.id, t.version, to_jsonb(t) AS doc");

        let row = qb
            .build()
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_error(table, e))?;
        self.decode(table, &row)
    }

    async fn update(
        &mut self,
        table: &str,
        id: RecordId,
        changes: &FieldMap,
    ) -> StoreResult<StoredRecord> {
        self.table(table)?;
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "UPDATE {} AS t SET version = t.version + 1",
            quote(table)
        ));
        for (field, value) in changes {
            qb.push(format!(", {} = ", quote(field)));
            push_value(&mut qb, value);
        }
        qb.push(" WHERE t.id = ");
        qb.push_bind(id.as_uuid());
        qb.push(" RETURNING t.id, t.version, to_jsonb(t) AS doc");

        let row = qb
            .build()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_error(table, e))?
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id,
            })?;
        self.decode(table, &row)
    }

    async fn delete(&mut self, table: &str, id: RecordId) -> StoreResult<()> {
        self.table(table)?;
        let sql = format!("DELETE FROM {} WHERE id = $1", quote(table));
        let done = sqlx::query(&sql)
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_error(table, e))?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id,
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &FieldValue) {
    match value {
        FieldValue::Null => {
            qb.push("NULL");
        }
        FieldValue::Text(s) => {
            qb.push_bind(s.clone());
        }
        FieldValue::Integer(n) => {
            qb.push_bind(*n);
        }
        FieldValue::Decimal(d) => {
            qb.push_bind(*d);
        }
        FieldValue::Boolean(b) => {
            qb.push_bind(*b);
        }
        FieldValue::Date(d) => {
            qb.push_bind(*d);
        }
        FieldValue::Json(v) => {
            qb.push_bind(sqlx::types::Json(v.clone()));
        }
        FieldValue::Ref(id) => {
            qb.push_bind(id.as_uuid());
        }
    }
}

fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text => "text",
        FieldType::Integer => "bigint",
        FieldType::Decimal => "numeric",
        FieldType::Boolean => "boolean",
        FieldType::Date => "date",
        FieldType::Json => "jsonb",
        FieldType::Ref => "uuid",
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn map_error(table: &str, error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
            table: table.to_string(),
            constraint: db.constraint().unwrap_or("unique").to_string(),
        },
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Connection(error.to_string())
        }
        _ => StoreError::Backend(error.to_string()),
    }
}
