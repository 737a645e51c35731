//! Stream and table naming
//!
//! Stream names arrive as separator-joined identifiers
//! (`<catalog>-<schema>-<table>` at their longest) and are split back into
//! their parts to drive schema routing and table naming. Staging tables get a
//! fresh uuid-derived name per load so concurrent loads never collide.

use uuid::Uuid;

/// Catalog, schema and table name derived from a stream name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParts {
    /// Source catalog, present only for three-or-more part names
    pub catalog_name: Option<String>,
    /// Source schema, present for two-or-more part names
    pub schema_name: Option<String>,
    /// Table name; trailing parts are joined with underscores
    pub table_name: String,
}

/// Split a stream name into catalog, schema and table parts
pub fn stream_name_to_dict(stream_name: &str, separator: &str) -> StreamParts {
    let parts: Vec<&str> = stream_name.split(separator).collect();

    match parts.len() {
        2 => StreamParts {
            catalog_name: None,
            schema_name: Some(parts[0].to_string()),
            table_name: parts[1].to_string(),
        },
        n if n > 2 => StreamParts {
            catalog_name: Some(parts[0].to_string()),
            schema_name: Some(parts[1].to_string()),
            table_name: parts[2..].join("_"),
        },
        _ => StreamParts {
            catalog_name: None,
            schema_name: None,
            table_name: stream_name.to_string(),
        },
    }
}

/// The source schema part of a stream name, empty when absent
pub fn stream_schema_name(stream_name: &str) -> String {
    stream_name_to_dict(stream_name, "-")
        .schema_name
        .unwrap_or_default()
}

/// Quoted, lowercased table name for a stream, without schema qualification
pub fn table_name_without_schema(stream_name: &str) -> String {
    let parts = stream_name_to_dict(stream_name, "-");
    format!(
        "\"{}\"",
        parts.table_name.replace(['.', '-'], "_").to_lowercase()
    )
}

/// Schema-qualified table name for a stream
pub fn table_name(stream_name: &str, schema_name: &str) -> String {
    format!("{}.{}", schema_name, table_name_without_schema(stream_name))
}

/// A unique staging table name, scoped to one load operation
pub fn temp_table_name() -> String {
    format!("tmp_{}", Uuid::new_v4().to_string().replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_part_stream_name() {
        let parts = stream_name_to_dict("db-schema-my-table", "-");
        assert_eq!(parts.catalog_name.as_deref(), Some("db"));
        assert_eq!(parts.schema_name.as_deref(), Some("schema"));
        assert_eq!(parts.table_name, "my_table");
    }

    #[test]
    fn test_two_part_stream_name() {
        let parts = stream_name_to_dict("schema-users", "-");
        assert_eq!(parts.catalog_name, None);
        assert_eq!(parts.schema_name.as_deref(), Some("schema"));
        assert_eq!(parts.table_name, "users");
    }

    #[test]
    fn test_one_part_stream_name() {
        let parts = stream_name_to_dict("users", "-");
        assert_eq!(parts.catalog_name, None);
        assert_eq!(parts.schema_name, None);
        assert_eq!(parts.table_name, "users");
    }

    #[test]
    fn test_table_name_is_quoted_lowercased_and_qualified() {
        assert_eq!(
            table_name("tap_mysql-Users", "analytics"),
            "analytics.\"users\""
        );
        assert_eq!(table_name_without_schema("a-b-c.d"), "\"c_d\"");
    }

    #[test]
    fn test_temp_table_names_are_unique() {
        let a = temp_table_name();
        let b = temp_table_name();
        assert!(a.starts_with("tmp_"));
        assert_ne!(a, b);
        assert!(!a.contains('-'));
    }
}
