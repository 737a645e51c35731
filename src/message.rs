//! Stream messages and state emission
//!
//! Types for the schema and record messages handed over by the message
//! reader, injection of the `_sdc_*` metadata columns that describe each
//! load, and the state side channel: one JSON line per checkpoint written to
//! standard output and flushed immediately, the only externally visible
//! artifact besides the warehouse tables themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::Write;
use tracing::debug;

use crate::error::{TargetError, TargetResult};

/// Timestamp the record was extracted from the source
pub const SDC_EXTRACTED_AT: &str = "_sdc_extracted_at";

/// Timestamp the record was batched for loading
pub const SDC_BATCHED_AT: &str = "_sdc_batched_at";

/// Deletion marker: non-null when the source-side record was deleted
pub const SDC_DELETED_AT: &str = "_sdc_deleted_at";

/// Schema message for one stream: destination naming, the JSON schema every
/// record of the stream is expected to match, and the primary-key properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSchemaMessage {
    /// Stream name, `<catalog>-<schema>-<table>` at its longest
    pub stream: String,
    /// JSON schema describing the stream's record shape
    pub schema: Value,
    /// Properties forming the composite primary key; may be empty
    #[serde(default)]
    pub key_properties: Vec<String>,
}

/// A single record message from the stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMessage {
    /// The nested record payload
    pub record: Value,
    /// Extraction timestamp reported by the source, if any
    #[serde(default)]
    pub time_extracted: Option<DateTime<Utc>>,
}

/// Extend a stream schema with the `_sdc_*` metadata columns so they are
/// created and evolved like any source column
pub fn add_metadata_columns_to_schema(schema_message: &mut StreamSchemaMessage) {
    if let Some(properties) = schema_message
        .schema
        .get_mut("properties")
        .and_then(Value::as_object_mut)
    {
        properties.insert(
            SDC_EXTRACTED_AT.to_string(),
            json!({"type": ["null", "string"], "format": "date-time"}),
        );
        properties.insert(
            SDC_BATCHED_AT.to_string(),
            json!({"type": ["null", "string"], "format": "date-time"}),
        );
        properties.insert(SDC_DELETED_AT.to_string(), json!({"type": ["null", "string"]}));
    }
}

/// Populate the `_sdc_*` metadata values on an incoming record
pub fn add_metadata_values_to_record(record_message: &RecordMessage) -> Value {
    let mut record = record_message.record.clone();

    if let Some(fields) = record.as_object_mut() {
        fields.insert(
            SDC_EXTRACTED_AT.to_string(),
            record_message
                .time_extracted
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        fields.insert(
            SDC_BATCHED_AT.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        // carried through from the source when present
        let deleted_at = record_message
            .record
            .get(SDC_DELETED_AT)
            .cloned()
            .unwrap_or(Value::Null);
        fields.insert(SDC_DELETED_AT.to_string(), deleted_at);
    }

    record
}

/// Emit a state checkpoint as one JSON line on standard output, flushed
/// immediately so downstream components see it right away
pub fn emit_state(state: Option<&Value>) -> TargetResult<()> {
    let Some(state) = state else {
        return Ok(());
    };

    let line = serde_json::to_string(state)
        .map_err(|e| TargetError::Serialization(format!("Failed to serialize state: {}", e)))?;
    debug!(%line, "emitting state");

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line).map_err(|e| TargetError::Io(e.to_string()))?;
    stdout.flush().map_err(|e| TargetError::Io(e.to_string()))?;

    Ok(())
}
