//! Schema and record flattening
//!
//! Converts nested JSON-schema-described streams into a flat column model:
//! property paths are joined into collision-safe identifiers, nested `object`
//! properties are spliced in up to a configurable depth, and composite values
//! are carried as JSON text. The flattened schema is the single source of
//! truth for column order in DDL and in the bulk-load text format.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::error::{TargetError, TargetResult};

/// Identifier length ceiling; joined keys at or above this are reduced
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Separator used when joining property path segments
pub const FLATTEN_SEPARATOR: &str = "__";

/// Ordered mapping of flat column name to its originating leaf schema
pub type FlattenedSchema = BTreeMap<String, Value>;

/// Flat column name to scalar-or-JSON-encoded value, for one record
pub type FlatRecord = HashMap<String, Value>;

/// Camel-case a path segment: uppercase the first letter and every letter
/// following an underscore, dropping the underscores
fn camelize(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut upper_next = true;
    for c in segment.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Join a property path into a flat column name, shortening segments from the
/// outermost inward while the joined form is at or above the identifier
/// ceiling.
///
/// Each offending segment is camel-cased and stripped of lowercase letters;
/// if fewer than two characters survive, the segment falls back to its first
/// three characters. Either way the replacement is lowercased. Reduction can
/// make two distinct paths collide; the schema flattener treats that as a
/// fatal conflict rather than merging them.
pub fn flatten_key(key: &str, parent_key: &[String], separator: &str) -> String {
    let mut inflected: Vec<String> = parent_key.to_vec();
    inflected.push(key.to_string());

    let mut reducer_index = 0;
    while joined_len(&inflected, separator) >= MAX_IDENTIFIER_LENGTH
        && reducer_index < inflected.len()
    {
        let reduced: String = camelize(&inflected[reducer_index])
            .chars()
            .filter(|c| !c.is_ascii_lowercase())
            .collect();
        inflected[reducer_index] = if reduced.chars().count() > 1 {
            reduced.to_lowercase()
        } else {
            inflected[reducer_index]
                .chars()
                .take(3)
                .collect::<String>()
                .to_lowercase()
        };
        reducer_index += 1;
    }

    inflected.join(separator)
}

fn joined_len(segments: &[String], separator: &str) -> usize {
    let chars: usize = segments.iter().map(|s| s.chars().count()).sum();
    chars + separator.chars().count() * segments.len().saturating_sub(1)
}

/// Flatten a JSON schema into an ordered flat-column mapping.
///
/// Nested `object` properties with their own `properties` are recursed into
/// while the current depth is below `max_level`; everything else becomes one
/// column. Output is sorted by flat name; a duplicate flat name is a fatal
/// schema conflict.
pub fn flatten_schema(schema: &Value, max_level: usize) -> TargetResult<FlattenedSchema> {
    let mut items: Vec<(String, Value)> = Vec::new();
    collect_schema_items(schema, &[], FLATTEN_SEPARATOR, 0, max_level, &mut items);

    items.sort_by(|a, b| a.0.cmp(&b.0));
    for pair in items.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(TargetError::SchemaConflict(pair[0].0.clone()));
        }
    }

    Ok(items.into_iter().collect())
}

fn collect_schema_items(
    schema: &Value,
    parent_key: &[String],
    separator: &str,
    level: usize,
    max_level: usize,
    items: &mut Vec<(String, Value)>,
) {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };

    for (key, property) in properties {
        let new_key = flatten_key(key, parent_key, separator);

        if property.get("type").is_some() {
            let is_nested_object = property
                .get("type")
                .is_some_and(|t| type_tag_present(t, "object"))
                && property.get("properties").is_some();
            if is_nested_object && level < max_level {
                let mut child_path = parent_key.to_vec();
                child_path.push(key.clone());
                collect_schema_items(
                    property,
                    &child_path,
                    separator,
                    level + 1,
                    max_level,
                    items,
                );
            } else {
                items.push((new_key, property.clone()));
            }
        } else if let Some(leaf) = first_alternative(property) {
            items.push((new_key, leaf));
        } else if property.as_object().is_some_and(|o| !o.is_empty()) {
            warn!(property = %key, "unsupported schema alternative shape, skipping");
        }
    }
}

/// A property given as a union of alternatives carries no `type` of its own.
/// When the first alternative's type is `string`, `array` or `object`, emit
/// it widened to a nullable union; other shapes are not guessed at.
fn first_alternative(property: &Value) -> Option<Value> {
    let first = property
        .as_object()?
        .values()
        .next()?
        .as_array()?
        .first()?;
    let type_tag = first.get("type")?.as_str()?;

    if matches!(type_tag, "string" | "array" | "object") {
        let mut leaf = first.clone();
        leaf["type"] = Value::Array(vec![
            Value::String("null".to_string()),
            Value::String(type_tag.to_string()),
        ]);
        Some(leaf)
    } else {
        None
    }
}

fn type_tag_present(type_value: &Value, tag: &str) -> bool {
    match type_value {
        Value::String(t) => t == tag,
        Value::Array(types) => types.iter().any(|t| t.as_str() == Some(tag)),
        _ => false,
    }
}

/// Flatten a record to match its flattened schema.
///
/// Nested mappings are recursed into below `max_level`; composite values, and
/// values of columns whose schema type union is exactly `{null, object,
/// array}`, are JSON-text-encoded. Scalars pass through unencoded.
pub fn flatten_record(
    record: &Map<String, Value>,
    flattened: &FlattenedSchema,
    max_level: usize,
) -> FlatRecord {
    let mut items = FlatRecord::new();
    collect_record_items(
        record,
        flattened,
        &[],
        FLATTEN_SEPARATOR,
        0,
        max_level,
        &mut items,
    );
    items
}

fn collect_record_items(
    record: &Map<String, Value>,
    flattened: &FlattenedSchema,
    parent_key: &[String],
    separator: &str,
    level: usize,
    max_level: usize,
    items: &mut FlatRecord,
) {
    for (key, value) in record {
        let new_key = flatten_key(key, parent_key, separator);

        if let Some(nested) = value.as_object().filter(|_| level < max_level) {
            let mut child_path = parent_key.to_vec();
            child_path.push(key.clone());
            collect_record_items(
                nested,
                flattened,
                &child_path,
                separator,
                level + 1,
                max_level,
                items,
            );
        } else if should_json_encode(&new_key, value, flattened) {
            // serializing a Value cannot fail
            items.insert(
                new_key,
                Value::String(serde_json::to_string(value).unwrap_or_default()),
            );
        } else {
            items.insert(new_key, value.clone());
        }
    }
}

fn should_json_encode(key: &str, value: &Value, flattened: &FlattenedSchema) -> bool {
    if value.is_object() || value.is_array() {
        return true;
    }

    // A column typed exactly {null, object, array} always carries JSON text,
    // even when the present value happens to be a scalar
    flattened
        .get(key)
        .and_then(|schema| schema.get("type"))
        .and_then(Value::as_array)
        .is_some_and(|types| {
            let tags: Vec<&str> = types.iter().filter_map(Value::as_str).collect();
            tags.len() == types.len()
                && tags.iter().all(|t| matches!(*t, "null" | "object" | "array"))
                && ["null", "object", "array"]
                    .iter()
                    .all(|t| tags.contains(t))
        })
}

/// Render one flattened record as a delimited text line, in flattened-schema
/// column order.
///
/// A field renders as the value's JSON representation when the column is
/// present and its value is `0`, `false` or otherwise non-empty; an absent
/// key, a null, or an empty string renders as an empty field. Numeric zero
/// must never be swallowed by a truthiness check.
pub fn record_to_csv_line(flat_record: &FlatRecord, flattened: &FlattenedSchema) -> String {
    flattened
        .keys()
        .map(|name| match flat_record.get(name) {
            Some(Value::Null) | None => String::new(),
            Some(Value::String(s)) if s.is_empty() => String::new(),
            Some(value) => serde_json::to_string(value).unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Prefix the bulk-copy payload with the column header line unless it is
/// already present. Idempotent: an existing header is never duplicated.
pub fn with_header(data: &str, header: &str) -> String {
    if data.lines().next() == Some(header) {
        data.to_string()
    } else {
        format!("{}\n{}", header, data)
    }
}
