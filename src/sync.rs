//! Per-stream table synchronization and staged merge loading
//!
//! [`DbSync`] owns one stream end-to-end: it flattens the stream's schema,
//! reconciles the destination table's DDL against it, and merge-loads record
//! batches through an ephemeral staging table.
//!
//! Schema evolution never destroys data: a column whose inferred type changed
//! is renamed with a UTC timestamp suffix and re-added under its original
//! name, so history stays queryable under the versioned identity. Columns are
//! never dropped automatically; [`DbSync::drop_column`] exists as an explicit
//! administrative action only.
//!
//! The merge itself is an update-then-insert pair joined on the primary key.
//! Statements run with autocommit semantics, so a failure between the two
//! phases leaves the permanent table partially updated; the insert phase's
//! anti-join makes a retried load safe, a retried update merely redundant.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::client::WarehouseClient;
use crate::config::{ConnectionConfig, Grantees};
use crate::error::{TargetError, TargetResult};
use crate::flatten::{
    FlatRecord, FlattenedSchema, flatten_record, flatten_schema, record_to_csv_line, with_header,
};
use crate::message::{SDC_DELETED_AT, StreamSchemaMessage};
use crate::naming;
use crate::types::{column_clause, column_type, safe_column_name};

/// A column addition scheduled by [`DbSync::reconcile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnAdd {
    /// Flat column name
    pub name: String,
    /// DDL fragment, `"name" type`
    pub clause: String,
}

/// A type change scheduled as rename-then-add
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnVersion {
    /// Quoted name of the existing column to rename
    pub column_name: String,
    /// DDL fragment for the replacement column
    pub clause: String,
}

/// Plan of DDL changes bringing a table in line with a flattened schema
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Columns to add
    pub additions: Vec<ColumnAdd>,
    /// Columns to version-then-add
    pub versions: Vec<ColumnVersion>,
}

impl SyncPlan {
    /// True when the table already matches the schema
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.versions.is_empty()
    }
}

/// Outcome of one batch load
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSummary {
    /// Rows inserted into the permanent table
    pub inserted: u64,
    /// Rows updated in the permanent table
    pub updated: u64,
    /// Size of the staged text payload
    pub size_bytes: usize,
}

/// Schema-aware loader for one stream
#[derive(Debug)]
pub struct DbSync {
    connection_config: ConnectionConfig,
    stream_schema_message: StreamSchemaMessage,
    schema_name: String,
    grantees: Option<Grantees>,
    indices: Vec<String>,
    flattened_schema: FlattenedSchema,
}

impl DbSync {
    /// Build a loader for one stream.
    ///
    /// Validates the connection configuration (reporting every violation),
    /// resolves the target schema and grantees for the stream, and flattens
    /// the stream schema. Fails fast on colliding flat column names.
    pub fn new(
        connection_config: ConnectionConfig,
        stream_schema_message: StreamSchemaMessage,
    ) -> TargetResult<Self> {
        let config_errors = connection_config.validate();
        if !config_errors.is_empty() {
            return Err(TargetError::Configuration(config_errors));
        }

        let source_schema = naming::stream_schema_name(&stream_schema_message.stream);
        let schema_name =
            connection_config.target_schema(&stream_schema_message.stream, &source_schema)?;
        let grantees = connection_config.grantees(&source_schema).cloned();

        let table = naming::stream_name_to_dict(&stream_schema_message.stream, "-").table_name;
        let indices = connection_config.indices(&source_schema, &table);

        let flattened_schema = flatten_schema(
            &stream_schema_message.schema,
            connection_config.data_flattening_max_level,
        )?;

        Ok(Self {
            connection_config,
            stream_schema_message,
            schema_name,
            grantees,
            indices,
            flattened_schema,
        })
    }

    /// Target schema resolved for this stream
    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    /// The flattened schema currently driving DDL and encoding
    pub fn flattened_schema(&self) -> &FlattenedSchema {
        &self.flattened_schema
    }

    fn max_level(&self) -> usize {
        self.connection_config.data_flattening_max_level
    }

    /// Schema-qualified permanent table name for this stream
    pub fn table_name(&self) -> String {
        naming::table_name(&self.stream_schema_message.stream, &self.schema_name)
    }

    fn table_name_without_schema(&self) -> String {
        naming::table_name_without_schema(&self.stream_schema_message.stream)
    }

    /// Quoted names of every column, in flattened-schema order
    pub fn column_names(&self) -> Vec<String> {
        self.flattened_schema
            .keys()
            .map(|name| safe_column_name(name))
            .collect()
    }

    fn primary_column_names(&self) -> Vec<String> {
        self.stream_schema_message
            .key_properties
            .iter()
            .map(|p| safe_column_name(p))
            .collect()
    }

    /// Flatten a record against this stream's schema
    pub fn flatten(&self, record: &Map<String, Value>) -> FlatRecord {
        flatten_record(record, &self.flattened_schema, self.max_level())
    }

    /// Build the unique primary-key string for a record, `None` when the
    /// stream defines no primary keys.
    ///
    /// A configured key property missing from the flattened record is a
    /// validation error carrying the key list and the record for diagnostics.
    /// An explicit null is rejected the same way: a null key part cannot
    /// identify a row for the merge join, so treating it as a renderable
    /// value would silently corrupt the dedup key.
    pub fn record_primary_key_string(
        &self,
        record: &Map<String, Value>,
    ) -> TargetResult<Option<String>> {
        let key_properties = &self.stream_schema_message.key_properties;
        if key_properties.is_empty() {
            return Ok(None);
        }

        let flat = self.flatten(record);
        let mut key_parts = Vec::with_capacity(key_properties.len());
        for property in key_properties {
            match flat.get(property) {
                Some(Value::String(s)) => key_parts.push(s.clone()),
                Some(value) if !value.is_null() => key_parts.push(value.to_string()),
                _ => {
                    return Err(TargetError::RecordValidation {
                        keys: key_properties.clone(),
                        record: Value::Object(flat.into_iter().collect()),
                    });
                }
            }
        }

        Ok(Some(key_parts.join(",")))
    }

    /// Render a record as one bulk-load text line
    pub fn record_to_csv_line(&self, record: &Map<String, Value>) -> String {
        record_to_csv_line(&self.flatten(record), &self.flattened_schema)
    }

    /// Generate the CREATE TABLE statement for this stream's schema.
    ///
    /// Staging tables get the same columns as the permanent table but no
    /// primary-key constraint: a batch may legitimately carry duplicate-key
    /// rows (last write wins at merge time) and must still stage cleanly.
    fn create_table_query(&self, table_name: Option<&str>, is_temporary: bool) -> String {
        let mut clauses: Vec<String> = self
            .flattened_schema
            .iter()
            .map(|(name, schema)| column_clause(name, schema))
            .collect();

        if !is_temporary && !self.stream_schema_message.key_properties.is_empty() {
            clauses.push(format!(
                "PRIMARY KEY ({})",
                self.primary_column_names().join(", ")
            ));
        }

        let name = match table_name {
            Some(name) => name.to_string(),
            None => self.table_name(),
        };

        format!(
            "CREATE {}TABLE IF NOT EXISTS {} ({}){}",
            if is_temporary { "TEMPORARY " } else { "" },
            name,
            clauses.join(", "),
            if is_temporary { " ON COMMIT PRESERVE ROWS" } else { "" },
        )
    }

    fn primary_key_condition(&self, right_table: &str) -> String {
        self.primary_column_names()
            .iter()
            .map(|c| format!("s.{} = {}.{}", c, right_table, c))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn primary_key_null_condition(&self, right_table: &str) -> String {
        self.primary_column_names()
            .iter()
            .map(|c| format!("{}.{} is null", right_table, c))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn update_from_temp_table(&self, temp_table: &str) -> String {
        let table = self.table_name();
        let assignments: Vec<String> = self
            .column_names()
            .iter()
            .map(|c| format!("{}=s.{}", c, c))
            .collect();

        format!(
            "UPDATE {} SET {} FROM {} s WHERE {}",
            table,
            assignments.join(", "),
            temp_table,
            self.primary_key_condition(&table),
        )
    }

    fn insert_from_temp_table(&self, temp_table: &str) -> String {
        let table = self.table_name();
        let columns = self.column_names().join(", ");

        if self.stream_schema_message.key_properties.is_empty() {
            return format!(
                "INSERT INTO {} ({}) (SELECT s.* FROM {} s)",
                table, columns, temp_table
            );
        }

        format!(
            "INSERT INTO {} ({}) (SELECT s.* FROM {} s LEFT OUTER JOIN {} t ON {} WHERE {})",
            table,
            columns,
            temp_table,
            table,
            self.primary_key_condition("t"),
            self.primary_key_null_condition("t"),
        )
    }

    /// Bulk-load a batch of records into the permanent table.
    ///
    /// Stages the batch in a fresh temporary table via an all-or-nothing
    /// bulk copy, then merges: update on primary-key equality followed by an
    /// anti-join insert, or a straight append when the stream has no primary
    /// keys. The two phases are individually atomic but not jointly; see the
    /// module docs for the partial-failure window.
    pub async fn load_batch(
        &self,
        client: &dyn WarehouseClient,
        records: &[Map<String, Value>],
    ) -> TargetResult<LoadSummary> {
        let lines: Vec<String> = records
            .iter()
            .map(|record| self.record_to_csv_line(record))
            .collect();
        let payload = lines.join("\n");
        let size_bytes = payload.len();

        info!(
            "Loading {} rows into '{}'",
            records.len(),
            self.table_name()
        );

        let temp_table = naming::temp_table_name();
        client
            .execute(&self.create_table_query(Some(&temp_table), true))
            .await?;

        let header = self.column_names().join(", ");
        let copy_sql = format!(
            "COPY {} FROM STDIN PARSER fcsvparser(delimiter=',', type='traditional') ABORT ON ERROR",
            temp_table
        );
        client
            .copy_in(&copy_sql, with_header(&payload, &header).as_bytes())
            .await?;

        let mut updated = 0;
        if !self.stream_schema_message.key_properties.is_empty() {
            updated = client
                .execute(&self.update_from_temp_table(&temp_table))
                .await?;
        }
        let inserted = client
            .execute(&self.insert_from_temp_table(&temp_table))
            .await?;

        let summary = LoadSummary {
            inserted,
            updated,
            size_bytes,
        };
        info!(
            "Loading into {}: {}",
            self.table_name(),
            serde_json::to_string(&summary).unwrap_or_default()
        );

        Ok(summary)
    }

    /// Hard-delete rows whose deletion marker is set, returning the count
    pub async fn delete_rows(&self, client: &dyn WarehouseClient) -> TargetResult<u64> {
        let table = self.table_name();
        let query = format!("DELETE FROM {} WHERE {} IS NOT NULL", table, SDC_DELETED_AT);
        info!("Deleting rows from '{}' table... {}", table, query);

        let deleted = client.execute(&query).await?;
        info!("DELETE {}", deleted);
        Ok(deleted)
    }

    /// Create the target schema when it does not exist yet, granting usage to
    /// the configured roles exactly once on creation.
    ///
    /// `table_columns_cache` is an optional pre-collected snapshot of the
    /// warehouse's objects; without it the live catalog is queried.
    pub async fn create_schema_if_not_exists(
        &self,
        client: &dyn WarehouseClient,
        table_columns_cache: Option<&[Value]>,
    ) -> TargetResult<()> {
        let schema_name = &self.schema_name;

        let schema_rows = match table_columns_cache {
            Some(cache) => cache
                .iter()
                .filter(|row| {
                    row.get("TABLE_SCHEMA").and_then(Value::as_str) == Some(schema_name.as_str())
                })
                .count(),
            None => {
                client
                    .query(
                        "SELECT LOWER(schema_name) schema_name \
                         FROM v_catalog.schemata \
                         WHERE LOWER(schema_name) = $1",
                        &[Value::String(schema_name.to_lowercase())],
                    )
                    .await?
                    .row_count()
            }
        };

        if schema_rows == 0 {
            let query = format!("CREATE SCHEMA IF NOT EXISTS {}", schema_name);
            info!("Schema '{}' does not exist. Creating... {}", schema_name, query);
            client.execute(&query).await?;

            self.grant_usage_on_schema(client).await?;
        }

        Ok(())
    }

    /// List the tables of the target schema from the live catalog
    async fn get_tables(&self, client: &dyn WarehouseClient) -> TargetResult<Vec<Value>> {
        Ok(client
            .query(
                "SELECT table_name FROM v_catalog.tables WHERE table_schema = $1",
                &[Value::String(self.schema_name.clone())],
            )
            .await?
            .rows)
    }

    /// Fetch the live column catalog for one table of the target schema
    pub async fn get_table_columns(
        &self,
        client: &dyn WarehouseClient,
        table_name: &str,
    ) -> TargetResult<Vec<Value>> {
        Ok(client
            .query(
                "SELECT column_name, data_type FROM v_catalog.columns \
                 WHERE lower(table_name) = $1 AND lower(table_schema) = $2",
                &[
                    Value::String(table_name.replace('"', "").to_lowercase()),
                    Value::String(self.schema_name.to_lowercase()),
                ],
            )
            .await?
            .rows)
    }

    /// Diff the flattened schema against a column catalog.
    ///
    /// Names match case-insensitively. A column absent from the catalog is an
    /// addition; a column whose reported type differs from the freshly
    /// computed one is versioned: renamed away, then re-added with the new
    /// type. Columns present only in the catalog are left untouched.
    pub fn reconcile(&self, catalog: &[Value]) -> SyncPlan {
        let catalog_types: std::collections::HashMap<String, String> = catalog
            .iter()
            .filter_map(|row| {
                let name = row.get("column_name")?.as_str()?;
                let data_type = row.get("data_type")?.as_str()?;
                Some((name.to_lowercase(), data_type.to_lowercase()))
            })
            .collect();

        let mut plan = SyncPlan::default();

        for (name, schema) in &self.flattened_schema {
            match catalog_types.get(&name.to_lowercase()) {
                None => plan.additions.push(ColumnAdd {
                    name: name.clone(),
                    clause: column_clause(name, schema),
                }),
                Some(reported) if *reported != column_type(schema).to_lowercase() => {
                    plan.versions.push(ColumnVersion {
                        column_name: safe_column_name(name),
                        clause: column_clause(name, schema),
                    });
                }
                Some(_) => {}
            }
        }

        debug!(?plan, "reconciled schema against catalog");
        plan
    }

    /// Execute a sync plan: plain ADDs first, then each versioned column is
    /// renamed with a timestamp suffix and re-added under its original name
    pub async fn apply(&self, client: &dyn WarehouseClient, plan: &SyncPlan) -> TargetResult<()> {
        for add in &plan.additions {
            self.add_column(client, &add.clause).await?;
        }

        for version in &plan.versions {
            self.version_column(client, &version.column_name).await?;
            self.add_column(client, &version.clause).await?;
        }

        Ok(())
    }

    /// Add a new column to the permanent table
    async fn add_column(&self, client: &dyn WarehouseClient, clause: &str) -> TargetResult<()> {
        let query = format!("ALTER TABLE {} ADD COLUMN {}", self.table_name(), clause);
        info!("Adding column: {}", query);
        client.execute(&query).await?;
        Ok(())
    }

    /// Rename a column out of the way, preserving its data under a
    /// timestamp-suffixed identity
    async fn version_column(
        &self,
        client: &dyn WarehouseClient,
        column_name: &str,
    ) -> TargetResult<()> {
        let query = format!(
            "ALTER TABLE {} RENAME COLUMN {} TO \"{}_{}\"",
            self.table_name(),
            column_name,
            column_name.replace('"', ""),
            chrono::Utc::now().format("%Y%m%d_%H%M"),
        );
        info!("Versioning column: {}", query);
        client.execute(&query).await?;
        Ok(())
    }

    /// Drop a column. Never invoked by reconciliation; explicit
    /// administrative use only.
    pub async fn drop_column(
        &self,
        client: &dyn WarehouseClient,
        column_name: &str,
    ) -> TargetResult<()> {
        let query = format!("ALTER TABLE {} DROP COLUMN {}", self.table_name(), column_name);
        info!("Dropping column: {}", query);
        client.execute(&query).await?;
        Ok(())
    }

    /// Create or alter the permanent table to match the flattened schema.
    ///
    /// Existence is checked against the live table list rather than relying
    /// on `IF NOT EXISTS` alone, so the grant-on-create side effect fires
    /// exactly once on first creation. An existing table is reconciled
    /// instead. Configured index columns are projected afterwards either way.
    pub async fn sync_table(&self, client: &dyn WarehouseClient) -> TargetResult<()> {
        let table_name = self.table_name_without_schema();
        let tables = self.get_tables(client).await?;

        let found = tables.iter().any(|row| {
            row.get("table_name")
                .and_then(Value::as_str)
                .is_some_and(|name| format!("\"{}\"", name.to_lowercase()) == table_name)
        });

        if !found {
            let query = self.create_table_query(None, false);
            info!("Table '{}' does not exist. Creating... {}", table_name, query);
            client.execute(&query).await?;

            self.grant_select_on_all_tables_in_schema(client).await?;
        } else {
            info!("Table '{}' exists", table_name);
            let columns = self.get_table_columns(client, &table_name).await?;
            let plan = self.reconcile(&columns);
            self.apply(client, &plan).await?;
        }

        self.create_projections(client).await
    }

    async fn grant_usage_on_schema(&self, client: &dyn WarehouseClient) -> TargetResult<()> {
        for grantee in self.grantee_roles() {
            let query = format!(
                "GRANT USAGE ON SCHEMA {} TO {}",
                self.schema_name, grantee
            );
            info!(
                "Granting USAGE privilege on '{}' schema to '{}'... {}",
                self.schema_name, grantee, query
            );
            client.execute(&query).await?;
        }
        Ok(())
    }

    async fn grant_select_on_all_tables_in_schema(
        &self,
        client: &dyn WarehouseClient,
    ) -> TargetResult<()> {
        for grantee in self.grantee_roles() {
            let query = format!(
                "GRANT SELECT ON ALL TABLES IN SCHEMA {} TO {}",
                self.schema_name, grantee
            );
            info!(
                "Granting SELECT ON ALL TABLES privilege on '{}' schema to '{}'... {}",
                self.schema_name, grantee, query
            );
            client.execute(&query).await?;
        }
        Ok(())
    }

    fn grantee_roles(&self) -> Vec<String> {
        self.grantees
            .as_ref()
            .map(|g| g.roles().iter().map(|r| r.to_string()).collect())
            .unwrap_or_default()
    }

    /// Project the configured index columns; the warehouse has no secondary
    /// indexes, projections stand in for them
    async fn create_projections(&self, client: &dyn WarehouseClient) -> TargetResult<()> {
        for column in &self.indices {
            self.create_projection(client, column).await?;
        }
        Ok(())
    }

    async fn create_projection(
        &self,
        client: &dyn WarehouseClient,
        column: &str,
    ) -> TargetResult<()> {
        let table = self.table_name();
        let table_without_schema = self.table_name_without_schema();
        let index_name = format!(
            "i_{}_{}",
            table_without_schema
                .chars()
                .take(30)
                .collect::<String>()
                .replace([' ', '"'], ""),
            column.replace(',', "_"),
        );
        let query = format!(
            "CREATE PROJECTION IF NOT EXISTS {} AS SELECT ({}) FROM {}",
            index_name, column, table
        );
        info!(
            "Creating projection on '{}' table on '{}' column(s)... {}",
            table, column, query
        );
        client.execute(&query).await?;
        Ok(())
    }
}
