//! Warehouse client abstraction
//!
//! The loader core drives the warehouse through the [`WarehouseClient`]
//! trait: plain queries, statements returning affected-row counts, and bulk
//! text loads. Connection pooling is deliberately out of scope; each logical
//! operation is handed a client whose session lifetime the caller controls.
//!
//! [`PostgresClient`] is the shipped implementation for warehouse endpoints
//! speaking the Postgres wire protocol. Query rows are decoded into
//! `serde_json::Value` objects so the core never depends on driver row types.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, pin_mut};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::{TargetError, TargetResult};

/// Query result set with rows as JSON objects keyed by column name
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Rows of data
    pub rows: Vec<Value>,
}

impl QueryResult {
    /// Create a new query result
    pub fn new(columns: Vec<String>, rows: Vec<Value>) -> Self {
        Self { columns, rows }
    }

    /// Create an empty result
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get the number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Synchronous-request/response SQL execution surface the loader core needs
/// from the warehouse driver
#[async_trait(?Send)]
pub trait WarehouseClient: Send + Sync {
    /// Run a query and return the full result set
    async fn query(&self, sql: &str, params: &[Value]) -> TargetResult<QueryResult>;

    /// Run a statement, returning the number of rows affected
    async fn execute(&self, sql: &str) -> TargetResult<u64>;

    /// Bulk-load delimited text into a table, returning the number of rows
    /// copied. All-or-nothing: the first malformed row aborts the batch.
    async fn copy_in(&self, sql: &str, data: &[u8]) -> TargetResult<u64>;
}

/// Warehouse client for Postgres wire protocol endpoints
pub struct PostgresClient {
    client: Arc<Mutex<tokio_postgres::Client>>,
}

impl PostgresClient {
    /// Open a connection from a validated loader configuration
    pub async fn connect(config: &ConnectionConfig) -> TargetResult<Self> {
        Self::new(&config.connection_string()).await
    }

    /// Open a connection from a raw driver connection string
    pub async fn new(connection_string: &str) -> TargetResult<Self> {
        let (client, connection) =
            tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
                .await
                .map_err(|e| TargetError::ConnectionFailed(e.to_string()))?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("warehouse connection error: {}", e);
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    /// Convert a driver row to a JSON value
    fn row_to_json(row: &tokio_postgres::Row, columns: &[String]) -> Value {
        let mut map = serde_json::Map::new();

        for (i, col_name) in columns.iter().enumerate() {
            map.insert(col_name.clone(), Self::get_column_value(row, i));
        }

        Value::Object(map)
    }

    /// Get a column value as JSON
    fn get_column_value(row: &tokio_postgres::Row, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
            return v.map(Value::String).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
            return v
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
        }

        Value::Null
    }
}

#[async_trait(?Send)]
impl WarehouseClient for PostgresClient {
    async fn query(&self, sql: &str, params: &[Value]) -> TargetResult<QueryResult> {
        debug!(%sql, "running query");
        let client = self.client.lock().await;

        // Catalog lookups bind text parameters only
        let string_params: Vec<String> = params
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect();
        let param_refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = string_params
            .iter()
            .map(|s| s as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();

        let rows = client
            .query(sql, &param_refs)
            .await
            .map_err(|e| TargetError::QueryFailed(e.to_string()))?;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let json_rows: Vec<Value> = rows
            .iter()
            .map(|row| Self::row_to_json(row, &columns))
            .collect();

        Ok(QueryResult::new(columns, json_rows))
    }

    async fn execute(&self, sql: &str) -> TargetResult<u64> {
        debug!(%sql, "running statement");
        let client = self.client.lock().await;

        client
            .execute(sql, &[])
            .await
            .map_err(|e| TargetError::QueryFailed(e.to_string()))
    }

    async fn copy_in(&self, sql: &str, data: &[u8]) -> TargetResult<u64> {
        debug!(%sql, bytes = data.len(), "bulk copy");
        let client = self.client.lock().await;

        let sink = client
            .copy_in::<_, Bytes>(sql)
            .await
            .map_err(|e| TargetError::BulkLoad(e.to_string()))?;
        pin_mut!(sink);

        sink.send(Bytes::copy_from_slice(data))
            .await
            .map_err(|e| TargetError::BulkLoad(e.to_string()))?;

        sink.finish()
            .await
            .map_err(|e| TargetError::BulkLoad(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_result_empty() {
        let result = QueryResult::empty();
        assert!(result.is_empty());
        assert_eq!(result.row_count(), 0);
    }

    #[test]
    fn test_query_result_counts_rows() {
        let result = QueryResult::new(
            vec!["table_name".to_string()],
            vec![serde_json::json!({"table_name": "users"})],
        );
        assert!(!result.is_empty());
        assert_eq!(result.row_count(), 1);
    }
}
