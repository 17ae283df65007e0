use super::*;
use crate::config::Config;
use serde_json::json;
use tempfile::TempDir;

const DIM: u32 = 8;

/// Deterministic embedder for tests: a byte histogram, so similar text maps
/// to nearby vectors without a model.
struct StubEmbedder {
    dimension: usize,
}

impl Embedder for StubEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        for byte in text.bytes() {
            vector[byte as usize % self.dimension] += 1.0;
        }
        vector
    }
}

fn test_config(base_dir: &std::path::Path) -> Config {
    let mut config = Config::load(base_dir).expect("Failed to load config");
    config.ollama.embedding_dimension = DIM;
    config
}

fn stub_embedder() -> Option<Box<dyn Embedder>> {
    Some(Box::new(StubEmbedder {
        dimension: DIM as usize,
    }))
}

fn map_from(value: serde_json::Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn acme_fields() -> Map<String, Value> {
    map_from(json!({"vendor_name": "Acme Corp", "total_amount": "500.00"}))
}

#[test]
fn add_and_retrieve_single_document() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());
    let mut engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");

    let added = engine.add_document(
        "Invoice #123 Acme Corp",
        acme_fields(),
        map_from(json!({"filename": "a.pdf"})),
    );

    assert!(added);
    assert_eq!(engine.len(), 1);

    let results = engine.retrieve_similar("Invoice #123 Acme Corp", &acme_fields(), 3);

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record.filename(), "a.pdf");
}

#[test]
fn retrieve_from_empty_store_returns_empty() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());
    let engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");

    let results = engine.retrieve_similar("Invoice #123", &Map::new(), 3);
    assert!(results.is_empty());
}

#[test]
fn retrieval_bounded_by_store_size_and_k() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());
    let mut engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");

    for i in 0..4 {
        let added = engine.add_document(
            &format!("Invoice #{}", i),
            Map::new(),
            map_from(json!({"filename": format!("doc_{}.pdf", i)})),
        );
        assert!(added);
    }

    assert_eq!(engine.retrieve_similar("Invoice", &Map::new(), 2).len(), 2);
    assert_eq!(engine.retrieve_similar("Invoice", &Map::new(), 10).len(), 4);
    assert!(engine.retrieve_similar("Invoice", &Map::new(), 0).is_empty());
}

#[test]
fn results_ordered_by_ascending_distance() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());
    let mut engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");

    engine.add_document("Electric service invoice", Map::new(), Map::new());
    engine.add_document("Invoice #123 Acme Corp", Map::new(), Map::new());
    engine.add_document("Completely unrelated grocery list", Map::new(), Map::new());

    let results = engine.retrieve_similar("Invoice #123 Acme Corp", &Map::new(), 3);

    assert_eq!(results.len(), 3);
    for pair in results.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
    // The exact duplicate is the closest match
    assert_eq!(results[0].distance, 0.0);
    assert_eq!(results[0].record.text_excerpt, "Invoice #123 Acme Corp");
}

#[test]
fn add_fails_without_embedder() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());
    let mut engine = RagEngine::new(&config, None).expect("Failed to create engine");

    let added = engine.add_document("Invoice #123", Map::new(), Map::new());

    assert!(!added);
    assert_eq!(engine.len(), 0);
}

#[test]
fn retrieve_returns_empty_without_embedder() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());

    {
        let mut engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");
        assert!(engine.add_document("Invoice #123", Map::new(), Map::new()));
    }

    // Reopen without an embedder: the store has documents but cannot embed
    // the query
    let engine = RagEngine::new(&config, None).expect("Failed to create engine");
    assert_eq!(engine.len(), 1);
    assert!(engine.retrieve_similar("Invoice #123", &Map::new(), 3).is_empty());
}

#[test]
fn persisted_state_survives_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());

    {
        let mut engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");
        engine.add_document(
            "Invoice #123 Acme Corp",
            acme_fields(),
            map_from(json!({"filename": "a.pdf"})),
        );
        engine.add_document(
            "Invoice #124 Birch Energy",
            map_from(json!({"vendor_name": "Birch Energy"})),
            map_from(json!({"filename": "b.pdf"})),
        );
    }

    let engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");

    assert_eq!(engine.len(), 2);
    let results = engine.retrieve_similar("Invoice #123 Acme Corp", &acme_fields(), 1);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record.filename(), "a.pdf");
    assert_eq!(
        results[0].record.fields.get("vendor_name"),
        Some(&Value::String("Acme Corp".to_string()))
    );
}

#[test]
fn corrupt_store_falls_back_to_empty() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());

    {
        let mut engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");
        engine.add_document("Invoice #123", Map::new(), Map::new());
    }

    std::fs::write(config.vector_db_path().join("invoice_index.json"), "garbage")
        .expect("Failed to corrupt artifact");

    let engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");
    assert_eq!(engine.len(), 0);
    assert!(engine.status().index_available);
}

#[test]
fn constructor_fails_when_both_dependencies_unavailable() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(temp_dir.path());
    // Point storage at a path that cannot be created
    config.base_dir = temp_dir.path().join("blocked");
    std::fs::write(&config.base_dir, b"not a directory").expect("Failed to create blocker");

    let result = RagEngine::new(&config, None);
    assert!(matches!(result, Err(RagError::Unavailable(_))));
}

#[test]
fn embedder_dimension_mismatch_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());

    let embedder: Option<Box<dyn Embedder>> = Some(Box::new(StubEmbedder { dimension: 3 }));
    let result = RagEngine::new(&config, embedder);

    assert!(matches!(result, Err(RagError::Config(_))));
}

#[test]
fn clear_empties_store_and_persists() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());

    {
        let mut engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");
        engine.add_document("Invoice #123", Map::new(), Map::new());
        engine.clear().expect("Failed to clear");
        assert!(engine.is_empty());
    }

    let engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");
    assert!(engine.is_empty());
}

#[test]
fn status_reports_store_state() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());
    let mut engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");

    engine.add_document("Invoice #123", Map::new(), Map::new());
    let status = engine.status();

    assert!(status.embedder_available);
    assert!(status.index_available);
    assert_eq!(status.document_count, 1);
    assert_eq!(status.embedding_dimension, DIM as usize);
    assert!(status.snapshot_exists);
}

#[test]
fn snapshot_compaction_after_interval() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(temp_dir.path());
    config.storage.snapshot_interval = 2;

    let mut engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");
    engine.add_document("Invoice #1", Map::new(), Map::new());
    engine.add_document("Invoice #2", Map::new(), Map::new());

    // Both adds are folded into the snapshot, leaving an empty WAL
    let wal = std::fs::read_to_string(config.vector_db_path().join("invoice_wal.jsonl"))
        .expect("Failed to read WAL");
    assert!(wal.is_empty());

    // And the snapshot alone reproduces the store
    let engine = RagEngine::new(&config, stub_embedder()).expect("Failed to create engine");
    assert_eq!(engine.len(), 2);
}

#[test]
fn context_for_prompt_empty_input_is_empty_string() {
    assert_eq!(context_for_prompt(&[]), "");
}

#[test]
fn context_for_prompt_renders_preferred_fields() {
    let record = DocumentRecord::new(
        "Invoice #123",
        map_from(json!({
            "vendor_name": "Acme Corp",
            "total_amount": "500.00",
            "irrelevant_field": "ignored",
        })),
        map_from(json!({"filename": "a.pdf"})),
    );
    let documents = vec![RetrievedDocument {
        record,
        distance: 0.5,
    }];

    let context = context_for_prompt(&documents);

    assert!(context.starts_with("CONTEXT FROM SIMILAR INVOICES:"));
    assert!(context.contains("Similar Invoice 1:"));
    assert!(context.contains("Filename: a.pdf"));
    assert!(context.contains("vendor_name: Acme Corp"));
    assert!(context.contains("total_amount: 500.00"));
    assert!(!context.contains("irrelevant_field"));
}

#[test]
fn context_for_prompt_includes_well_related_fields_once() {
    let record = DocumentRecord::new(
        "Invoice #123",
        map_from(json!({
            "well_name": "Lucky Lad #4",
            "lease_operator": "Acme Corp",
            "charge": "Pumping",
        })),
        Map::new(),
    );
    let documents = vec![RetrievedDocument {
        record,
        distance: 0.0,
    }];

    let context = context_for_prompt(&documents);

    assert!(context.contains("Filename: Unknown"));
    assert!(context.contains("lease_operator: Acme Corp"));
    // Preferred fields must not be duplicated by the keyword scan
    assert_eq!(context.matches("well_name: Lucky Lad #4").count(), 1);
    assert_eq!(context.matches("charge: Pumping").count(), 1);
}

#[test]
fn context_for_prompt_skips_empty_values() {
    let record = DocumentRecord::new(
        "Invoice #123",
        map_from(json!({"vendor_name": "", "invoice_id": "42"})),
        Map::new(),
    );
    let documents = vec![RetrievedDocument {
        record,
        distance: 0.0,
    }];

    let context = context_for_prompt(&documents);

    assert!(!context.contains("vendor_name"));
    assert!(context.contains("invoice_id: 42"));
}

#[test]
fn shared_engine_usable_across_threads() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());
    let shared = RagEngine::new(&config, stub_embedder())
        .expect("Failed to create engine")
        .into_shared();

    let worker = {
        let shared = Arc::clone(&shared);
        std::thread::spawn(move || {
            let mut engine = shared.lock().expect("poisoned");
            engine.add_document("Invoice #123", Map::new(), Map::new())
        })
    };

    assert!(worker.join().expect("worker panicked"));
    let engine = shared.lock().expect("poisoned");
    assert_eq!(engine.len(), 1);
}
