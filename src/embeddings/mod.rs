// Embeddings module
// Text preparation plus the embedding backend adapter


pub mod ollama;

pub use ollama::OllamaEmbedder;

use serde_json::{Map, Value};

/// Maximum number of characters of raw document text used for embedding and
/// stored in the record excerpt. Bounds storage and embedding cost.
pub const EXCERPT_CHAR_LIMIT: usize = 1000;

/// Converts text into a fixed-length numeric vector.
///
/// Implementations must always return a vector of `dimension()` length, even
/// when the backing model fails on a particular input; per-call failures
/// degrade to the zero vector so a bad retrieval never aborts ingestion.
pub trait Embedder: Send {
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Truncate raw document text to the stored excerpt length.
///
/// Operates on char boundaries, not bytes.
#[inline]
pub fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_CHAR_LIMIT).collect()
}

/// Build the canonical embedding text for a document: the text excerpt
/// followed by each field rendered as a `key: value` line.
///
/// This function is shared by the add and query paths; both sides must embed
/// the same representation or similarity scores are meaningless. Scalar field
/// values (strings, numbers, booleans) are included; null, arrays, and nested
/// objects are skipped.
#[inline]
pub fn prepare_document_text(text: &str, fields: &Map<String, Value>) -> String {
    let mut parts = vec![excerpt(text)];

    for (key, value) in fields {
        if let Some(rendered) = render_scalar(value) {
            parts.push(format!("{}: {}", key, rendered));
        }
    }

    parts.join("\n")
}

/// Render a scalar JSON value for inclusion in embedding text.
pub(crate) fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
