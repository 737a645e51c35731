//! Error types for the loader
//!
//! Errors are typed so that callers can discriminate between fatal
//! configuration problems, per-record validation failures they may choose to
//! skip-and-log, and SQL errors surfaced from the warehouse driver.

use serde_json::Value;

/// Error type for loader operations
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// Connection configuration is invalid. Carries every violation found,
    /// not just the first.
    #[error("Invalid configuration:\n   * {}", .0.join("\n   * "))]
    Configuration(Vec<String>),

    /// Two distinct property paths normalized to the same flat column name
    #[error("Duplicate column name produced in schema: {0}")]
    SchemaConflict(String),

    /// A configured primary-key property is missing from a flattened record
    #[error("Cannot find {keys:?} primary key(s) in record: {record}")]
    RecordValidation {
        /// Configured primary-key properties
        keys: Vec<String>,
        /// The flattened record, for diagnostics
        record: Value,
    },

    /// A row failed the strict bulk-copy format; the whole batch is aborted
    #[error("Bulk load failed: {0}")]
    BulkLoad(String),

    /// Failed to connect to the warehouse
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type for loader operations
pub type TargetResult<T> = Result<T, TargetError>;
