use anyhow::{Context, Result};
use console::style;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{Config, default_base_dir};
use crate::embeddings::{Embedder, OllamaEmbedder};
use crate::engine::{RagEngine, context_for_prompt};

fn load_config(base_dir: Option<PathBuf>) -> Result<Config> {
    let base_dir = match base_dir {
        Some(dir) => dir,
        None => default_base_dir().context("Failed to determine storage directory")?,
    };
    Config::load(base_dir)
}

/// Connect the embedding backend, degrading to `None` when unavailable so
/// maintenance commands still work against the persisted store.
fn connect_embedder(config: &Config) -> Option<Box<dyn Embedder>> {
    match OllamaEmbedder::connect(&config.ollama) {
        Ok(embedder) => Some(Box::new(embedder)),
        Err(e) => {
            warn!("Embedding backend unavailable: {:#}", e);
            None
        }
    }
}

fn read_field_map(path: Option<&Path>, what: &str) -> Result<Map<String, Value>> {
    let Some(path) = path else {
        return Ok(Map::new());
    };

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file: {}", what, path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {} file: {}", what, path.display()))?;

    match value {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{} file must contain a JSON object: {}", what, path.display()),
    }
}

/// Show the health and size of the retrieval store
#[inline]
pub fn show_status(base_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config(base_dir)?;

    println!("{}", style("Invoice RAG Store Status").bold());
    println!("{}", "=".repeat(40));
    println!("Storage root: {}", config.vector_db_path().display());
    println!();

    let embedder = connect_embedder(&config);
    match &embedder {
        Some(_) => println!(
            "{} Embedding backend: {}:{} ({})",
            style("✅").green(),
            config.ollama.host,
            config.ollama.port,
            config.ollama.model
        ),
        None => println!(
            "{} Embedding backend: unreachable at {}:{}",
            style("⚠️").yellow(),
            config.ollama.host,
            config.ollama.port
        ),
    }

    match RagEngine::new(&config, embedder) {
        Ok(engine) => {
            let status = engine.status();
            println!(
                "{} Vector index: {} ({} dimensions)",
                style("✅").green(),
                if status.index_available {
                    "available"
                } else {
                    "unavailable"
                },
                status.embedding_dimension
            );
            println!("   Documents stored: {}", status.document_count);
            println!("   Snapshot on disk: {}", status.snapshot_exists);
            println!("   Write-ahead log present: {}", status.wal_exists);
        }
        Err(e) => {
            println!("{} Store unusable: {}", style("❌").red(), e);
        }
    }

    Ok(())
}

/// Add one document to the store from a text file and optional field/metadata
/// JSON files
#[inline]
pub fn add_document(
    base_dir: Option<PathBuf>,
    text_file: &Path,
    fields_file: Option<&Path>,
    metadata_file: Option<&Path>,
) -> Result<()> {
    let config = load_config(base_dir)?;

    let text = fs::read_to_string(text_file)
        .with_context(|| format!("Failed to read document text: {}", text_file.display()))?;
    let fields = read_field_map(fields_file, "fields")?;
    let mut metadata = read_field_map(metadata_file, "metadata")?;

    if !metadata.contains_key("filename") {
        if let Some(name) = text_file.file_name().and_then(|n| n.to_str()) {
            metadata.insert("filename".to_string(), Value::String(name.to_string()));
        }
    }

    let mut engine = RagEngine::new(&config, connect_embedder(&config))?;

    if engine.add_document(&text, fields, metadata) {
        info!("Document added from {}", text_file.display());
        println!("Added document ({} total)", engine.len());
    } else {
        println!("Document was not added; check that the embedding backend is running");
        println!("Use 'invoice-rag status' to inspect the store");
    }

    Ok(())
}

/// Retrieve similar documents for a query and print the prompt context block
#[inline]
pub fn query(
    base_dir: Option<PathBuf>,
    text_file: &Path,
    fields_file: Option<&Path>,
    k: Option<usize>,
) -> Result<()> {
    let config = load_config(base_dir)?;

    let text = fs::read_to_string(text_file)
        .with_context(|| format!("Failed to read query text: {}", text_file.display()))?;
    let fields = read_field_map(fields_file, "fields")?;

    let engine = RagEngine::new(&config, connect_embedder(&config))?;
    let k = k.unwrap_or_else(|| engine.default_top_k());

    let results = engine.retrieve_similar(&text, &fields, k);

    if results.is_empty() {
        println!("No similar documents found");
        return Ok(());
    }

    println!("Retrieved {} similar documents:", results.len());
    for (i, result) in results.iter().enumerate() {
        println!(
            "  {}. {} (distance {:.4})",
            i + 1,
            result.record.filename(),
            result.distance
        );
    }
    println!();
    println!("{}", context_for_prompt(&results));

    Ok(())
}

/// Discard the entire store. Destructive; requires an explicit flag.
#[inline]
pub fn clear_store(base_dir: Option<PathBuf>, yes: bool) -> Result<()> {
    let config = load_config(base_dir)?;

    if !yes {
        println!("This deletes every stored document and cannot be undone.");
        println!("Re-run with --yes to confirm.");
        return Ok(());
    }

    // No embedder needed to clear
    let mut engine = RagEngine::new(&config, None)?;
    let count = engine.len();
    engine.clear()?;

    println!("Cleared {} documents from the store", count);
    Ok(())
}
