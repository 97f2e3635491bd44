//! Error types for the upload engine
//!
//! Batch-fatal errors (plan, scope, config) are raised before any row is
//! processed. Per-row data problems are not errors here: they are recorded as
//! outcomes in the row's result tree.

use thiserror::Error;

use crate::value::RecordId;

/// Top-level error for a batch
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity packs supplied for {packs} rows, but the batch has {rows} rows")]
    IdentityPackCount { rows: usize, packs: usize },

    #[error("Row source error: {0}")]
    RowSource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural errors in a plan document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Malformed plan document at '{path}': {message}")]
    Malformed { path: String, message: String },

    #[error("Unsupported plan version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Bad node type at '{path}': expected exactly one of 'record' or 'tree', found {found}")]
    BadNodeType { path: String, found: String },

    #[error("Unknown table '{table}' at '{path}'")]
    UnknownTable { path: String, table: String },

    #[error("Unknown field '{field}' on table '{table}' at '{path}'")]
    UnknownField {
        path: String,
        table: String,
        field: String,
    },

    #[error("Unknown relationship '{relationship}' on table '{table}' at '{path}'")]
    UnknownRelationship {
        path: String,
        table: String,
        relationship: String,
    },

    #[error("Relationship '{relationship}' at '{path}' is {actual}, but was used as {used_as}")]
    RelationshipKind {
        path: String,
        relationship: String,
        actual: &'static str,
        used_as: &'static str,
    },

    #[error("Relationship '{relationship}' at '{path}' targets '{expected}', but the sub-plan is for '{found}'")]
    TargetMismatch {
        path: String,
        relationship: String,
        expected: String,
        found: String,
    },

    #[error("Tree node at '{path}' names table '{table}', which has no tree definition")]
    NotATree { path: String, table: String },

    #[error("To-many slot at '{path}' must hold record nodes")]
    TreeInToMany { path: String },

    #[error("Rank '{rank}' at '{path}' is not declared by the tree of '{table}'")]
    DanglingRank {
        path: String,
        table: String,
        rank: String,
    },

    #[error("Rank '{rank}' at '{path}' is bound more than once")]
    DuplicateRank { path: String, rank: String },

    #[error("Field '{field}' of '{table}' at '{path}' is managed by the engine and cannot be mapped")]
    ProtectedField {
        path: String,
        table: String,
        field: String,
    },

    #[error("Static value for '{field}' at '{path}' is invalid: {message}")]
    InvalidStatic {
        path: String,
        field: String,
        message: String,
    },
}

/// Errors in the schema catalog itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Table '{table}': {message}")]
    InvalidTable { table: String, message: String },

    #[error("Relationship '{table}.{relationship}' targets unknown table '{target}'")]
    UnknownTarget {
        table: String,
        relationship: String,
        target: String,
    },

    #[error("Could not read schema: {0}")]
    Load(String),
}

/// Batch scope could not be established
#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("No scope value for '{scope_table}' required by node '{path}'")]
    Unresolved { path: String, scope_table: String },

    #[error("Scope record {id} in '{scope_table}' does not exist (node '{path}')")]
    NotFound {
        path: String,
        scope_table: String,
        id: RecordId,
    },

    #[error("Scope value '{value}' for '{scope_table}' is not a record id")]
    InvalidValue { scope_table: String, value: String },

    #[error("Storage error while resolving scope: {0}")]
    Store(#[from] StoreError),
}

/// Errors signalled by a record store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unique constraint '{constraint}' on '{table}' violated")]
    UniqueViolation { table: String, constraint: String },

    #[error("Record {id} not found in '{table}'")]
    NotFound { table: String, id: RecordId },

    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Late uniqueness violations are reported as conflicts rather than row aborts
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },

    #[error("Failed to read config {path}: {message}")]
    Read { path: String, message: String },
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
