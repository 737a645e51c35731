//! Connection configuration
//!
//! The loader is handed a JSON configuration object by the message reader.
//! Recognized options cover the warehouse connection itself, target-schema
//! routing, grantee roles, hard-delete propagation and the flattening depth.
//!
//! Target schema routing supports two styles and exactly one must be present:
//!
//! 1. `default_target_schema` — every incoming stream lands in the same schema
//! 2. `schema_mapping` — per-stream target schema, grantees and indices:
//!
//! ```json
//! "schema_mapping": {
//!     "my_tap_stream_id": {
//!         "target_schema": "my_warehouse_schema",
//!         "target_schema_select_permissions": ["role_with_select_privs"],
//!         "indices": { "my_table": ["column_1", "column_2"] }
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{TargetError, TargetResult};

/// Grantee roles: a single role name or a list of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Grantees {
    /// One role
    One(String),
    /// Multiple roles
    Many(Vec<String>),
}

impl Grantees {
    /// Flatten to a list of role names
    pub fn roles(&self) -> Vec<&str> {
        match self {
            Grantees::One(role) => vec![role.as_str()],
            Grantees::Many(roles) => roles.iter().map(|r| r.as_str()).collect(),
        }
    }
}

/// Per-stream overrides within `schema_mapping`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaMapping {
    /// Target schema for streams routed through this mapping
    pub target_schema: Option<String>,

    /// Roles granted USAGE/SELECT on the target schema
    pub target_schema_select_permissions: Option<Grantees>,

    /// Table name -> columns to project, merged with the defaults
    #[serde(default)]
    pub indices: HashMap<String, Vec<String>>,
}

/// Warehouse connection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Warehouse host (required)
    pub host: Option<String>,
    /// Warehouse port (required)
    pub port: Option<u16>,
    /// User name (required)
    pub user: Option<String>,
    /// Password (required)
    pub password: Option<String>,
    /// Database name (required)
    pub dbname: Option<String>,

    /// Enable required-SSL mode
    #[serde(default)]
    pub ssl: bool,

    /// Target schema shared by every stream not routed via `schema_mapping`
    pub default_target_schema: Option<String>,

    /// Per-stream schema routing, keyed by the stream's source schema name
    pub schema_mapping: Option<HashMap<String, SchemaMapping>>,

    /// Default roles granted SELECT on target schemas
    pub default_target_schema_select_permissions: Option<Grantees>,

    /// Propagate upstream deletes by removing rows whose deletion marker is set
    #[serde(default)]
    pub hard_delete: bool,

    /// Maximum nesting depth to flatten; 0 keeps only top-level properties
    #[serde(default)]
    pub data_flattening_max_level: usize,
}

impl ConnectionConfig {
    /// Parse a configuration from its JSON representation and validate it.
    ///
    /// Collects every violation before failing so that a misconfigured
    /// deployment surfaces all of its problems at once.
    pub fn from_value(value: serde_json::Value) -> TargetResult<Self> {
        let config: ConnectionConfig = serde_json::from_value(value)
            .map_err(|e| TargetError::Serialization(format!("Failed to parse config: {}", e)))?;

        let errors = config.validate();
        if !errors.is_empty() {
            return Err(TargetError::Configuration(errors));
        }

        Ok(config)
    }

    /// Validate the configuration, returning every violation found
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let required: [(&str, bool); 5] = [
            ("host", self.host.as_deref().is_none_or(str::is_empty)),
            ("port", self.port.is_none()),
            ("user", self.user.as_deref().is_none_or(str::is_empty)),
            ("password", self.password.as_deref().is_none_or(str::is_empty)),
            ("dbname", self.dbname.as_deref().is_none_or(str::is_empty)),
        ];
        for (key, missing) in required {
            if missing {
                errors.push(format!("Required key is missing from config: [{}]", key));
            }
        }

        if self.default_target_schema.as_deref().is_none_or(str::is_empty)
            && self.schema_mapping.is_none()
        {
            errors.push(
                "Neither 'default_target_schema' (string) nor 'schema_mapping' (object) \
                 keys set in config."
                    .to_string(),
            );
        }

        errors
    }

    /// Resolve the target schema for a stream.
    ///
    /// `schema_mapping` wins over `default_target_schema`; a stream with no
    /// route in either is a configuration error.
    pub fn target_schema(&self, stream_name: &str, source_schema: &str) -> TargetResult<String> {
        if let Some(mapping) = self
            .schema_mapping
            .as_ref()
            .and_then(|m| m.get(source_schema))
            && let Some(schema) = mapping.target_schema.as_deref()
        {
            return Ok(schema.to_string());
        }

        if let Some(schema) = self.default_target_schema.as_deref()
            && !schema.trim().is_empty()
        {
            return Ok(schema.trim().to_string());
        }

        Err(TargetError::Configuration(vec![format!(
            "Target schema name not defined in config. Neither 'default_target_schema' (string) \
             nor 'schema_mapping' (object) defines target schema for {} stream.",
            stream_name
        )]))
    }

    /// Resolve the grantee roles for a stream, per-stream override first
    pub fn grantees(&self, source_schema: &str) -> Option<&Grantees> {
        self.schema_mapping
            .as_ref()
            .and_then(|m| m.get(source_schema))
            .and_then(|m| m.target_schema_select_permissions.as_ref())
            .or(self.default_target_schema_select_permissions.as_ref())
    }

    /// Columns to project for a table of a stream, merged with the
    /// deletion-marker projection when hard-delete is enabled
    pub fn indices(&self, source_schema: &str, table_name: &str) -> Vec<String> {
        let mut indices = Vec::new();
        if self.hard_delete {
            indices.push(crate::message::SDC_DELETED_AT.to_string());
        }
        if let Some(mapping) = self
            .schema_mapping
            .as_ref()
            .and_then(|m| m.get(source_schema))
            && let Some(columns) = mapping.indices.get(table_name)
        {
            indices.extend(columns.iter().cloned());
        }
        indices
    }

    /// Build the driver connection string.
    ///
    /// Validation must have passed before this is called; missing keys
    /// render as empty values and will be rejected by the driver.
    pub fn connection_string(&self) -> String {
        let mut conn = format!(
            "host={} port={} user={} password={} dbname={}",
            self.host.as_deref().unwrap_or_default(),
            self.port.unwrap_or_default(),
            self.user.as_deref().unwrap_or_default(),
            self.password.as_deref().unwrap_or_default(),
            self.dbname.as_deref().unwrap_or_default(),
        );
        if self.ssl {
            conn.push_str(" sslmode=require");
        }
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_config() -> serde_json::Value {
        json!({
            "host": "localhost",
            "port": 5433,
            "user": "dbadmin",
            "password": "secret",
            "dbname": "warehouse",
            "default_target_schema": "analytics"
        })
    }

    #[test]
    fn test_minimal_config_is_valid() {
        let config = ConnectionConfig::from_value(minimal_config()).unwrap();
        assert_eq!(config.port, Some(5433));
        assert_eq!(config.data_flattening_max_level, 0);
        assert!(!config.hard_delete);
    }

    #[test]
    fn test_missing_keys_are_all_reported() {
        let config: ConnectionConfig =
            serde_json::from_value(json!({ "host": "localhost" })).unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().any(|e| e.contains("[port]")));
        assert!(errors.iter().any(|e| e.contains("[dbname]")));
        assert!(errors.iter().any(|e| e.contains("default_target_schema")));
    }

    #[test]
    fn test_empty_string_counts_as_missing() {
        let mut value = minimal_config();
        value["password"] = json!("");
        let config: ConnectionConfig = serde_json::from_value(value).unwrap();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("[password]")));
    }

    #[test]
    fn test_schema_routing_requires_one_style() {
        let mut value = minimal_config();
        value.as_object_mut().unwrap().remove("default_target_schema");
        let err = ConnectionConfig::from_value(value).unwrap_err();
        assert!(err.to_string().contains("default_target_schema"));
    }

    #[test]
    fn test_schema_mapping_wins_over_default() {
        let mut value = minimal_config();
        value["schema_mapping"] = json!({
            "tap_mysql": { "target_schema": "mysql_replica" }
        });
        let config = ConnectionConfig::from_value(value).unwrap();
        assert_eq!(
            config.target_schema("tap_mysql-users", "tap_mysql").unwrap(),
            "mysql_replica"
        );
        assert_eq!(
            config.target_schema("other-users", "other").unwrap(),
            "analytics"
        );
    }

    #[test]
    fn test_grantees_accept_string_or_list() {
        let mut value = minimal_config();
        value["default_target_schema_select_permissions"] = json!("analyst");
        let config = ConnectionConfig::from_value(value.clone()).unwrap();
        assert_eq!(config.grantees("any").unwrap().roles(), vec!["analyst"]);

        value["default_target_schema_select_permissions"] = json!(["analyst", "bi"]);
        let config = ConnectionConfig::from_value(value).unwrap();
        assert_eq!(config.grantees("any").unwrap().roles(), vec!["analyst", "bi"]);
    }

    #[test]
    fn test_indices_include_deletion_marker_when_hard_delete() {
        let mut value = minimal_config();
        value["hard_delete"] = json!(true);
        value["schema_mapping"] = json!({
            "tap_mysql": {
                "target_schema": "mysql_replica",
                "indices": { "users": ["updated_at"] }
            }
        });
        let config = ConnectionConfig::from_value(value).unwrap();
        let indices = config.indices("tap_mysql", "users");
        assert_eq!(indices, vec!["_sdc_deleted_at", "updated_at"]);
        assert_eq!(config.indices("tap_mysql", "orders"), vec!["_sdc_deleted_at"]);
    }

    #[test]
    fn test_connection_string_with_ssl() {
        let mut value = minimal_config();
        value["ssl"] = json!(true);
        let config = ConnectionConfig::from_value(value).unwrap();
        assert_eq!(
            config.connection_string(),
            "host=localhost port=5433 user=dbadmin password=secret dbname=warehouse sslmode=require"
        );
    }
}
