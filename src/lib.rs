//! Schema-aware incremental warehouse loader
//!
//! Provides the building blocks of a streaming JSON-to-warehouse target:
//! - Flattening nested JSON schemas and records into relational columns
//! - Mapping JSON types to warehouse column types
//! - Non-destructive table schema evolution (add and version, never drop)
//! - Staged merge loading through temporary tables with bulk CSV copy
//! - Stream-name to schema/table routing with per-stream configuration

pub mod client;
pub mod config;
pub mod error;
pub mod flatten;
pub mod message;
pub mod naming;
pub mod sync;
pub mod types;

// Re-export commonly used types
pub use client::{PostgresClient, QueryResult, WarehouseClient};
pub use config::{ConnectionConfig, Grantees, SchemaMapping};
pub use error::{TargetError, TargetResult};
pub use flatten::{FlatRecord, FlattenedSchema, flatten_record, flatten_schema};
pub use message::{RecordMessage, StreamSchemaMessage, emit_state};
pub use sync::{DbSync, LoadSummary, SyncPlan};
pub use types::{column_type, safe_column_name};
