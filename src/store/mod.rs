// Record store module
// Per-document metadata plus the durable persistence layer


pub mod persistence;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::embeddings::excerpt;

/// One entry per ingested document.
///
/// A record's only identity is its position in the store; it carries no
/// separate primary key. Records are append-only: no update, no delete, no
/// compaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    /// Creation time, set on insert and never mutated.
    pub timestamp: DateTime<Utc>,
    /// First 1000 characters of the raw document text.
    pub text_excerpt: String,
    /// Extracted field mapping as supplied by the caller. Keys are not
    /// validated.
    pub fields: Map<String, Value>,
    /// Opaque caller-supplied metadata (filename, provenance flags, etc.),
    /// passed through unchanged.
    pub caller_metadata: Map<String, Value>,
}

impl DocumentRecord {
    #[inline]
    pub fn new(
        text: &str,
        fields: Map<String, Value>,
        caller_metadata: Map<String, Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            text_excerpt: excerpt(text),
            fields,
            caller_metadata,
        }
    }

    /// The caller-supplied filename, or "Unknown" when absent.
    #[inline]
    pub fn filename(&self) -> &str {
        self.caller_metadata
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
    }
}
