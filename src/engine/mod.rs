// Retrieval engine
// Orchestrates the embedder, flat index, record store, and persistence

#[cfg(test)]
mod tests;

use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::embeddings::{Embedder, prepare_document_text, render_scalar};
use crate::index::FlatIndex;
use crate::store::DocumentRecord;
use crate::store::persistence::{Persistence, WalEntry};
use crate::{RagError, Result};

/// Fields surfaced first when rendering retrieved documents into prompt
/// context. Matches the validation-relevant entities of the invoice domain.
const PREFERRED_CONTEXT_FIELDS: [&str; 9] = [
    "vendor_name",
    "invoice_id",
    "invoice_number",
    "invoice_date",
    "total_amount",
    "balance_due",
    "well_name",
    "field",
    "charge",
];

/// Field-name keywords that mark additional well/lease/charge information
/// worth surfacing beyond the preferred set.
const WELL_KEYWORDS: [&str; 4] = ["well", "field", "lease", "charge"];

/// One retrieval hit: the stored record plus its squared L2 distance from the
/// query. Callers use the distance as a "have we seen this kind of document
/// before" heuristic.
#[derive(Debug, Clone)]
pub struct RetrievedDocument {
    pub record: DocumentRecord,
    pub distance: f32,
}

/// Diagnostic snapshot for operational health checks.
#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub embedder_available: bool,
    pub index_available: bool,
    pub document_count: usize,
    pub embedding_dimension: usize,
    pub snapshot_exists: bool,
    pub wal_exists: bool,
}

/// Handle for sharing one store across workers. Insert and append are not
/// atomic as a pair, so concurrent callers must go through the lock.
pub type SharedRagEngine = Arc<Mutex<RagEngine>>;

/// The similarity-retrieval store: remembers every processed document and
/// returns the most similar prior documents for prompt enrichment.
///
/// All state mutation flows through [`RagEngine::add_document`]; the three
/// parallel collections (index, raw embeddings, records) stay length-aligned
/// after every successful operation. Retrieval is an enhancement for the
/// surrounding pipeline, not a correctness requirement, so per-call
/// dependency failures degrade to failure signals instead of panics.
pub struct RagEngine {
    embedder: Option<Box<dyn Embedder>>,
    index: Option<FlatIndex>,
    embeddings: Vec<Vec<f32>>,
    records: Vec<DocumentRecord>,
    persistence: Persistence,
    dimension: usize,
    snapshot_interval: u32,
    adds_since_snapshot: u32,
    default_top_k: usize,
}

impl RagEngine {
    /// Construct the store, recovering persisted state where possible.
    ///
    /// A corrupt or partial persisted store is discarded in favor of a fresh
    /// empty one (retrieval quality degrades; ingestion must not block). The
    /// only fatal condition is both dependencies being unavailable: no
    /// embedder AND no usable storage for the index.
    #[inline]
    pub fn new(config: &Config, embedder: Option<Box<dyn Embedder>>) -> Result<Self> {
        let dimension = config.ollama.dimension();

        if let Some(embedder) = &embedder {
            if embedder.dimension() != dimension {
                return Err(RagError::Config(format!(
                    "Embedder dimension {} does not match configured dimension {}",
                    embedder.dimension(),
                    dimension
                )));
            }
        }

        let mut persistence = Persistence::new(config.vector_db_path());

        let (index, embeddings, records) = match persistence.load(dimension) {
            Ok(Some(state)) => (Some(state.index), state.embeddings, state.records),
            Ok(None) => {
                info!("No persisted store found, starting empty");
                Self::fresh_state(&mut persistence, dimension)
            }
            Err(e) => {
                warn!("Discarding corrupt persisted store: {:#}", e);
                Self::fresh_state(&mut persistence, dimension)
            }
        };

        if embedder.is_none() && index.is_none() {
            return Err(RagError::Unavailable(
                "Neither the embedding backend nor the index storage is usable".to_string(),
            ));
        }

        Ok(Self {
            embedder,
            index,
            embeddings,
            records,
            persistence,
            dimension,
            snapshot_interval: config.storage.snapshot_interval,
            adds_since_snapshot: 0,
            default_top_k: config.retrieval.top_k,
        })
    }

    /// Build an empty store and probe the storage root with one snapshot
    /// write. A failed probe means the index has no durable backing, which
    /// marks it unavailable.
    fn fresh_state(
        persistence: &mut Persistence,
        dimension: usize,
    ) -> (Option<FlatIndex>, Vec<Vec<f32>>, Vec<DocumentRecord>) {
        let index = FlatIndex::new(dimension);
        match persistence.save_snapshot(&index, &[], &[]) {
            Ok(()) => (Some(index), Vec::new(), Vec::new()),
            Err(e) => {
                error!(
                    "Storage root {} is not writable, index unavailable: {:#}",
                    persistence.root().display(),
                    e
                );
                (None, Vec::new(), Vec::new())
            }
        }
    }

    #[inline]
    pub fn into_shared(self) -> SharedRagEngine {
        Arc::new(Mutex::new(self))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Add a processed document to the store.
    ///
    /// Returns `false` without mutating anything when the embedder or index
    /// is unavailable or the insertion could not be made durable; the caller
    /// keeps processing the document either way. On success the insertion is
    /// on disk before this returns.
    #[inline]
    pub fn add_document(
        &mut self,
        text: &str,
        fields: Map<String, Value>,
        caller_metadata: Map<String, Value>,
    ) -> bool {
        let Some(embedder) = &self.embedder else {
            warn!("Embedding backend unavailable, document not added");
            return false;
        };
        let Some(index) = &mut self.index else {
            warn!("Vector index unavailable, document not added");
            return false;
        };

        let prepared = prepare_document_text(text, &fields);
        let embedding = embedder.embed(&prepared);

        let record = DocumentRecord::new(text, fields, caller_metadata);
        let entry = WalEntry {
            position: self.records.len(),
            embedding: embedding.clone(),
            record: record.clone(),
        };

        // Durability first: only mutate in-memory state once the insertion is
        // on disk, so a failed write leaves the store untouched.
        if let Err(e) = self.persistence.append_wal(&entry) {
            error!("Failed to persist document, store unchanged: {:#}", e);
            return false;
        }

        if let Err(e) = index.insert(embedding.clone()) {
            error!("Index rejected embedding: {}", e);
            return false;
        }
        self.embeddings.push(embedding);
        self.records.push(record);

        self.adds_since_snapshot += 1;
        if self.adds_since_snapshot >= self.snapshot_interval {
            self.compact();
        }

        info!(
            "Added document to vector store: {} ({} total)",
            self.records[self.records.len() - 1].filename(),
            self.records.len()
        );
        true
    }

    /// Retrieve the `k` most similar stored documents, closest first.
    ///
    /// An empty store short-circuits to an empty result without an embedding
    /// call. Results preserve the index's distance order; equal distances
    /// keep insertion order.
    #[inline]
    pub fn retrieve_similar(
        &self,
        text: &str,
        fields: &Map<String, Value>,
        k: usize,
    ) -> Vec<RetrievedDocument> {
        if self.records.is_empty() {
            info!("Vector store is empty, no similar documents to retrieve");
            return Vec::new();
        }

        let Some(embedder) = &self.embedder else {
            warn!("Embedding backend unavailable, skipping retrieval");
            return Vec::new();
        };
        let Some(index) = &self.index else {
            warn!("Vector index unavailable, skipping retrieval");
            return Vec::new();
        };

        let prepared = prepare_document_text(text, fields);
        let embedding = embedder.embed(&prepared);

        let hits = index.search(&embedding, k);
        let results: Vec<RetrievedDocument> = hits
            .into_iter()
            .map(|(position, distance)| RetrievedDocument {
                record: self.records[position].clone(),
                distance,
            })
            .collect();

        debug!("Retrieved {} similar documents", results.len());
        results
    }

    /// Discard all stored documents and persist the empty state.
    ///
    /// Maintenance operation only; normal operation is append-only.
    #[inline]
    pub fn clear(&mut self) -> Result<()> {
        let Some(index) = &mut self.index else {
            return Err(RagError::Unavailable(
                "Vector index unavailable".to_string(),
            ));
        };

        index.reset();
        self.embeddings.clear();
        self.records.clear();
        self.adds_since_snapshot = 0;

        self.persistence
            .save_snapshot(index, &self.embeddings, &self.records)
            .map_err(|e| RagError::Storage(format!("Failed to persist cleared store: {:#}", e)))?;

        info!("Cleared vector store");
        Ok(())
    }

    /// Diagnostic snapshot of the store's health.
    #[inline]
    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            embedder_available: self.embedder.is_some(),
            index_available: self.index.is_some(),
            document_count: self.records.len(),
            embedding_dimension: self.dimension,
            snapshot_exists: self.persistence.snapshot_exists(),
            wal_exists: self.persistence.wal_exists(),
        }
    }

    /// Fold the WAL into a fresh snapshot. Failure is not fatal: the WAL
    /// still holds every insertion, so nothing accepted is lost.
    fn compact(&mut self) {
        let Some(index) = &self.index else {
            return;
        };
        match self
            .persistence
            .save_snapshot(index, &self.embeddings, &self.records)
        {
            Ok(()) => self.adds_since_snapshot = 0,
            Err(e) => warn!("Snapshot compaction failed, keeping WAL: {:#}", e),
        }
    }
}

/// Render retrieved documents into a prompt-ready context block.
///
/// Returns an empty string for an empty input; callers must treat that as
/// "no context available" and not inject a bare header.
#[inline]
pub fn context_for_prompt(documents: &[RetrievedDocument]) -> String {
    if documents.is_empty() {
        return String::new();
    }

    let mut parts = vec!["CONTEXT FROM SIMILAR INVOICES:".to_string()];

    for (i, document) in documents.iter().enumerate() {
        let fields = &document.record.fields;

        parts.push(format!("\nSimilar Invoice {}:", i + 1));
        parts.push(format!("Filename: {}", document.record.filename()));

        for key in PREFERRED_CONTEXT_FIELDS {
            if let Some(rendered) = fields.get(key).and_then(render_scalar) {
                if !rendered.is_empty() {
                    parts.push(format!("{}: {}", key, rendered));
                }
            }
        }

        // Surface any remaining well-related fields, skipping the preferred
        // set to avoid duplicate lines
        for (key, value) in fields {
            let lowered = key.to_lowercase();
            if let Some(rendered) = value.as_str() {
                if WELL_KEYWORDS.iter().any(|term| lowered.contains(term))
                    && !PREFERRED_CONTEXT_FIELDS.contains(&key.as_str())
                {
                    parts.push(format!("{}: {}", key, rendered));
                }
            }
        }
    }

    parts.join("\n")
}
