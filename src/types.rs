//! Column type mapping
//!
//! Maps a JSON-schema leaf property to its warehouse column type. The rule
//! table is ordered: `object`/`array` win over any other co-present type tag,
//! then `format`, then the numeric and textual tags. The mapping is a pure
//! function so that the table synchronizer can compare freshly computed types
//! against the live catalog byte-for-byte (case-insensitively).

use serde_json::Value;
use tracing::debug;

/// Default width for textual fallback columns
const DEFAULT_VARCHAR: &str = "varchar(65000)";

/// Default width for JSON-encoded composite columns
const DEFAULT_LONG_VARCHAR: &str = "long varchar(1048576)";

/// Does the leaf's `type` (string or union) include the given tag?
fn type_contains(schema_property: &Value, tag: &str) -> bool {
    match schema_property.get("type") {
        Some(Value::String(t)) => t == tag,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(tag)),
        _ => false,
    }
}

/// `maxLength`, if present and sensible
fn max_length(schema_property: &Value) -> Option<u64> {
    schema_property.get("maxLength").and_then(Value::as_u64)
}

/// Take a leaf schema property and return the warehouse column type
pub fn column_type(schema_property: &Value) -> String {
    let property_format = schema_property.get("format").and_then(Value::as_str);

    let col_type = if type_contains(schema_property, "object")
        || type_contains(schema_property, "array")
    {
        match max_length(schema_property) {
            Some(len) => format!("long varchar({})", len),
            None => DEFAULT_LONG_VARCHAR.to_string(),
        }
    } else if property_format == Some("date-time") {
        // Every date-time JSON value is mapped to TIMESTAMP
        "timestamp".to_string()
    } else if property_format == Some("time") {
        "time".to_string()
    } else if type_contains(schema_property, "number") {
        "numeric".to_string()
    } else if type_contains(schema_property, "integer") && type_contains(schema_property, "string")
    {
        match max_length(schema_property) {
            Some(len) => format!("varchar({})", len),
            None => "varchar".to_string(),
        }
    } else if type_contains(schema_property, "integer") {
        match schema_property.get("maximum").and_then(Value::as_i64) {
            Some(max) if max <= 32767 => "smallint".to_string(),
            Some(max) if max <= 2147483647 => "int".to_string(),
            Some(_) => "bigint".to_string(),
            None => "integer".to_string(),
        }
    } else if type_contains(schema_property, "boolean") {
        "boolean".to_string()
    } else {
        match max_length(schema_property) {
            Some(len) => format!("varchar({})", len),
            None => DEFAULT_VARCHAR.to_string(),
        }
    };

    debug!(%schema_property, %col_type, "mapped schema property");

    col_type
}

/// Generate a SQL friendly, quoted and lowercased column name
pub fn safe_column_name(name: &str) -> String {
    format!("\"{}\"", name).to_lowercase()
}

/// Generate the DDL fragment `"name" type` for a leaf schema property
pub fn column_clause(name: &str, schema_property: &Value) -> String {
    format!("{} {}", safe_column_name(name), column_type(schema_property))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_and_array_win_over_other_tags() {
        assert_eq!(
            column_type(&json!({"type": ["null", "object", "array"]})),
            "long varchar(1048576)"
        );
        // format is ignored when a composite tag is present
        assert_eq!(
            column_type(&json!({"type": ["string", "object"], "format": "date-time"})),
            "long varchar(1048576)"
        );
        assert_eq!(
            column_type(&json!({"type": ["null", "array"], "maxLength": 4096})),
            "long varchar(4096)"
        );
    }

    #[test]
    fn test_format_mappings() {
        assert_eq!(
            column_type(&json!({"type": ["null", "string"], "format": "date-time"})),
            "timestamp"
        );
        assert_eq!(
            column_type(&json!({"type": ["null", "string"], "format": "time"})),
            "time"
        );
    }

    #[test]
    fn test_number_maps_to_numeric() {
        assert_eq!(column_type(&json!({"type": ["null", "number"]})), "numeric");
    }

    #[test]
    fn test_integer_and_string_maps_to_varchar() {
        assert_eq!(
            column_type(&json!({"type": ["null", "integer", "string"]})),
            "varchar"
        );
        assert_eq!(
            column_type(&json!({"type": ["integer", "string"], "maxLength": 16})),
            "varchar(16)"
        );
    }

    #[test]
    fn test_integer_sizing_boundaries() {
        assert_eq!(
            column_type(&json!({"type": ["null", "integer"], "maximum": 32767})),
            "smallint"
        );
        assert_eq!(
            column_type(&json!({"type": ["null", "integer"], "maximum": 32768})),
            "int"
        );
        assert_eq!(
            column_type(&json!({"type": ["null", "integer"], "maximum": 2147483647})),
            "int"
        );
        assert_eq!(
            column_type(&json!({"type": ["null", "integer"], "maximum": 2147483648i64})),
            "bigint"
        );
        assert_eq!(
            column_type(&json!({"type": ["null", "integer"], "maximum": 9223372036854775807i64})),
            "bigint"
        );
        assert_eq!(column_type(&json!({"type": ["null", "integer"]})), "integer");
    }

    #[test]
    fn test_boolean_and_fallback() {
        assert_eq!(column_type(&json!({"type": ["null", "boolean"]})), "boolean");
        assert_eq!(
            column_type(&json!({"type": ["null", "string"]})),
            "varchar(65000)"
        );
        assert_eq!(
            column_type(&json!({"type": ["null", "string"], "maxLength": 255})),
            "varchar(255)"
        );
    }

    #[test]
    fn test_column_type_is_deterministic() {
        let leaf = json!({"type": ["null", "integer"], "maximum": 100});
        assert_eq!(column_type(&leaf), column_type(&leaf));
    }

    #[test]
    fn test_safe_column_name_quotes_and_lowercases() {
        assert_eq!(safe_column_name("CamelCase"), "\"camelcase\"");
        assert_eq!(safe_column_name("plain"), "\"plain\"");
    }

    #[test]
    fn test_column_clause() {
        assert_eq!(
            column_clause("Id", &json!({"type": ["null", "integer"], "maximum": 100})),
            "\"id\" smallint"
        );
    }
}
