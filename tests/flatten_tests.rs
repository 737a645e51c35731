//! Integration tests for schema flattening, type mapping and CSV encoding

use serde_json::{Value, json};

use vertica_loader::flatten::{flatten_record, flatten_schema, record_to_csv_line};
use vertica_loader::naming::{stream_name_to_dict, table_name};
use vertica_loader::types::column_type;

fn orders_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "id": {"type": ["integer"], "maximum": 2147483647},
            "placed_at": {"type": ["null", "string"], "format": "date-time"},
            "total": {"type": ["null", "number"]},
            "customer": {
                "type": ["null", "object"],
                "properties": {
                    "name": {"type": ["null", "string"]},
                    "address": {
                        "type": ["null", "object"],
                        "properties": {
                            "city": {"type": ["null", "string"]}
                        }
                    }
                }
            },
            "tags": {"type": ["null", "array"]}
        }
    })
}

#[test]
fn test_flatten_schema_at_depth_one() {
    let flattened = flatten_schema(&orders_schema(), 1).unwrap();

    let names: Vec<&str> = flattened.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec![
            "customer__address",
            "customer__name",
            "id",
            "placed_at",
            "tags",
            "total"
        ]
    );

    // one level down, "customer__address" stays an object column
    assert_eq!(
        column_type(&flattened["customer__address"]),
        "long varchar(1048576)"
    );
    assert_eq!(column_type(&flattened["customer__name"]), "varchar(65000)");
    assert_eq!(column_type(&flattened["id"]), "int");
    assert_eq!(column_type(&flattened["placed_at"]), "timestamp");
    assert_eq!(column_type(&flattened["total"]), "numeric");
}

#[test]
fn test_flatten_schema_at_depth_zero_keeps_top_level_only() {
    let flattened = flatten_schema(&orders_schema(), 0).unwrap();
    assert!(flattened.contains_key("customer"));
    assert!(!flattened.contains_key("customer__name"));
    assert_eq!(
        column_type(&flattened["customer"]),
        "long varchar(1048576)"
    );
}

#[test]
fn test_flatten_record_mirrors_schema_depth() {
    let schema = flatten_schema(&orders_schema(), 1).unwrap();
    let record = json!({
        "id": 12,
        "placed_at": "2024-03-01T10:00:00Z",
        "total": 9.5,
        "customer": {
            "name": "Ada",
            "address": {"city": "London"}
        },
        "tags": ["new", "priority"]
    });

    let flat = flatten_record(record.as_object().unwrap(), &schema, 1);
    assert_eq!(flat["customer__name"], json!("Ada"));
    // below max depth: nested object is serialized as a JSON string
    assert_eq!(flat["customer__address"], json!("{\"city\":\"London\"}"));
    assert_eq!(flat["tags"], json!("[\"new\",\"priority\"]"));
    assert_eq!(flat["id"], json!(12));
}

#[test]
fn test_csv_line_renders_falsy_scalars_but_not_missing_values() {
    let schema = flatten_schema(
        &json!({
            "type": "object",
            "properties": {
                "count": {"type": ["null", "integer"]},
                "enabled": {"type": ["null", "boolean"]},
                "note": {"type": ["null", "string"]},
                "missing": {"type": ["null", "string"]}
            }
        }),
        0,
    )
    .unwrap();

    let record = json!({"count": 0, "enabled": false, "note": ""});
    let flat = flatten_record(record.as_object().unwrap(), &schema, 0);
    let line = record_to_csv_line(&flat, &schema);

    // columns in sorted order: count, enabled, missing, note
    assert_eq!(line, "0,false,,");
}

#[test]
fn test_csv_line_quotes_strings_and_embedded_commas() {
    let schema = flatten_schema(
        &json!({
            "type": "object",
            "properties": {
                "city": {"type": ["null", "string"]}
            }
        }),
        0,
    )
    .unwrap();

    let record = json!({"city": "London, UK"});
    let flat = flatten_record(record.as_object().unwrap(), &schema, 0);
    assert_eq!(record_to_csv_line(&flat, &schema), "\"London, UK\"");
}

#[test]
fn test_long_flat_names_are_reduced_below_identifier_limit() {
    let outer = "customer_delivery_address_extended";
    let inner = "street_line_one_with_building_and_floor_details";
    let mut inner_properties = serde_json::Map::new();
    inner_properties.insert(inner.to_string(), json!({"type": ["null", "string"]}));
    let mut properties = serde_json::Map::new();
    properties.insert(
        outer.to_string(),
        json!({"type": ["null", "object"], "properties": inner_properties}),
    );
    let schema = flatten_schema(&json!({"type": "object", "properties": properties}), 1).unwrap();

    let name = schema.keys().next().unwrap();
    assert!(name.chars().count() < 64, "got {} ({})", name, name.len());
    assert!(name.ends_with(inner), "reduced outermost segment first");
}

#[test]
fn test_stream_name_routing() {
    let parts = stream_name_to_dict("db-schema-my-table", "-");
    assert_eq!(parts.catalog_name.as_deref(), Some("db"));
    assert_eq!(parts.schema_name.as_deref(), Some("schema"));
    assert_eq!(parts.table_name, "my_table");

    let parts = stream_name_to_dict("users", "-");
    assert_eq!(parts.catalog_name, None);
    assert_eq!(parts.schema_name, None);
    assert_eq!(parts.table_name, "users");

    assert_eq!(
        table_name("tap_mysql-public-Order-Items", "analytics"),
        "analytics.\"order_items\""
    );
}
