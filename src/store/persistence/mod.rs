
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::index::FlatIndex;
use crate::store::DocumentRecord;

const FORMAT_VERSION: u32 = 1;

const INDEX_FILE: &str = "invoice_index.json";
const EMBEDDINGS_FILE: &str = "invoice_embeddings.json";
const RECORDS_FILE: &str = "invoice_records.json";
const WAL_FILE: &str = "invoice_wal.jsonl";

/// Durable storage for the store's three parallel collections.
///
/// State lives in three co-located snapshot artifacts (serialized index, raw
/// embedding list, record list) plus an append-only write-ahead log of
/// insertions since the last snapshot. The artifacts are versioned together
/// through a shared snapshot generation and are recovered or rejected as a
/// single unit; the WAL makes each accepted document durable without
/// rewriting the full state on every insert.
#[derive(Debug)]
pub struct Persistence {
    root: PathBuf,
    generation: u64,
}

/// Envelope wrapping each snapshot artifact on disk.
#[derive(Debug, Serialize, Deserialize)]
struct Artifact<T> {
    version: u32,
    generation: u64,
    payload: T,
}

/// One logged insertion: the embedding and its record, plus the store length
/// the pair was appended at. Replay uses the position to skip entries already
/// captured by a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub position: usize,
    pub embedding: Vec<f32>,
    pub record: DocumentRecord,
}

/// State recovered from disk.
#[derive(Debug)]
pub struct LoadedState {
    pub index: FlatIndex,
    pub embeddings: Vec<Vec<f32>>,
    pub records: Vec<DocumentRecord>,
}

impl Persistence {
    #[inline]
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            generation: 0,
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn snapshot_exists(&self) -> bool {
        self.root.join(INDEX_FILE).exists()
            && self.root.join(EMBEDDINGS_FILE).exists()
            && self.root.join(RECORDS_FILE).exists()
    }

    #[inline]
    pub fn wal_exists(&self) -> bool {
        self.root.join(WAL_FILE).exists()
    }

    /// Attempt to recover the persisted store.
    ///
    /// Returns `Ok(None)` when no snapshot has ever been written (fresh
    /// start). Any partial, unparsable, or mutually inconsistent state is an
    /// error; the caller falls back to an empty store rather than indexing
    /// against misaligned metadata.
    #[inline]
    pub fn load(&mut self, dimension: usize) -> Result<Option<LoadedState>> {
        if !self.snapshot_exists() {
            if self.root.join(INDEX_FILE).exists()
                || self.root.join(EMBEDDINGS_FILE).exists()
                || self.root.join(RECORDS_FILE).exists()
            {
                anyhow::bail!("Partial snapshot on disk: some artifacts are missing");
            }
            debug!("No persisted store found at {}", self.root.display());
            return Ok(None);
        }

        let index_artifact: Artifact<FlatIndex> = self.read_artifact(INDEX_FILE)?;
        let embeddings_artifact: Artifact<Vec<Vec<f32>>> = self.read_artifact(EMBEDDINGS_FILE)?;
        let records_artifact: Artifact<Vec<DocumentRecord>> = self.read_artifact(RECORDS_FILE)?;

        if index_artifact.generation != embeddings_artifact.generation
            || index_artifact.generation != records_artifact.generation
        {
            anyhow::bail!(
                "Snapshot generation mismatch: index={}, embeddings={}, records={}",
                index_artifact.generation,
                embeddings_artifact.generation,
                records_artifact.generation
            );
        }

        let mut index = index_artifact.payload;
        let mut embeddings = embeddings_artifact.payload;
        let mut records = records_artifact.payload;

        if index.dimension() != dimension {
            anyhow::bail!(
                "Snapshot dimension mismatch: expected {}, got {}",
                dimension,
                index.dimension()
            );
        }

        self.replay_wal(&mut index, &mut embeddings, &mut records)?;

        if index.len() != embeddings.len() || index.len() != records.len() {
            anyhow::bail!(
                "Persisted store is misaligned: index={}, embeddings={}, records={}",
                index.len(),
                embeddings.len(),
                records.len()
            );
        }

        self.generation = index_artifact.generation;

        info!(
            "Recovered persisted store with {} documents (generation {})",
            records.len(),
            self.generation
        );

        Ok(Some(LoadedState {
            index,
            embeddings,
            records,
        }))
    }

    /// Write all three artifacts atomically and truncate the WAL.
    ///
    /// Each artifact goes through a temp file and rename; a crash between
    /// renames leaves mismatched generations, which the next `load` rejects.
    #[inline]
    pub fn save_snapshot(
        &mut self,
        index: &FlatIndex,
        embeddings: &[Vec<f32>],
        records: &[DocumentRecord],
    ) -> Result<()> {
        fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create storage directory: {}", self.root.display())
        })?;

        let generation = self.generation + 1;

        self.write_artifact(INDEX_FILE, generation, index)?;
        self.write_artifact(EMBEDDINGS_FILE, generation, &embeddings)?;
        self.write_artifact(RECORDS_FILE, generation, &records)?;

        self.generation = generation;

        // WAL entries are now captured by the snapshot
        self.truncate_wal()?;

        debug!(
            "Saved snapshot with {} documents (generation {})",
            records.len(),
            generation
        );
        Ok(())
    }

    /// Append one insertion to the WAL and sync it to disk.
    ///
    /// The entry is durable before this returns; this is what makes a
    /// successful add survive an immediate crash.
    #[inline]
    pub fn append_wal(&self, entry: &WalEntry) -> Result<()> {
        fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create storage directory: {}", self.root.display())
        })?;

        let path = self.root.join(WAL_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open WAL: {}", path.display()))?;

        let mut line = serde_json::to_string(entry).context("Failed to serialize WAL entry")?;
        line.push('\n');

        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to WAL: {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync WAL: {}", path.display()))?;

        Ok(())
    }

    fn replay_wal(
        &self,
        index: &mut FlatIndex,
        embeddings: &mut Vec<Vec<f32>>,
        records: &mut Vec<DocumentRecord>,
    ) -> Result<()> {
        let path = self.root.join(WAL_FILE);
        if !path.exists() {
            return Ok(());
        }

        let file =
            File::open(&path).with_context(|| format!("Failed to open WAL: {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut replayed = 0usize;
        for line in reader.lines() {
            let line = line.with_context(|| format!("Failed to read WAL: {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }

            let entry: WalEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    // A torn trailing line is the normal crash shape; the add
                    // it belonged to never returned success.
                    warn!("Discarding unparsable WAL tail: {}", e);
                    break;
                }
            };

            if entry.position < records.len() {
                // Entry already captured by the snapshot; a crash between
                // snapshot rename and WAL truncation leaves these behind.
                continue;
            }
            if entry.position > records.len() {
                anyhow::bail!(
                    "WAL gap: entry at position {} but store has {} records",
                    entry.position,
                    records.len()
                );
            }

            index
                .insert(entry.embedding.clone())
                .map_err(|e| anyhow::anyhow!("WAL entry rejected by index: {}", e))?;
            embeddings.push(entry.embedding);
            records.push(entry.record);
            replayed += 1;
        }

        if replayed > 0 {
            info!("Replayed {} insertions from WAL", replayed);
        }
        Ok(())
    }

    fn truncate_wal(&self) -> Result<()> {
        let path = self.root.join(WAL_FILE);
        let file = File::create(&path)
            .with_context(|| format!("Failed to truncate WAL: {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync WAL: {}", path.display()))?;
        Ok(())
    }

    fn read_artifact<T: DeserializeOwned>(&self, name: &str) -> Result<Artifact<T>> {
        let path = self.root.join(name);
        let file = File::open(&path)
            .with_context(|| format!("Failed to open artifact: {}", path.display()))?;

        let artifact: Artifact<T> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse artifact: {}", path.display()))?;

        if artifact.version != FORMAT_VERSION {
            anyhow::bail!(
                "Unsupported artifact version {} in {}",
                artifact.version,
                path.display()
            );
        }

        Ok(artifact)
    }

    fn write_artifact<T: Serialize>(&self, name: &str, generation: u64, payload: &T) -> Result<()> {
        let path = self.root.join(name);
        let tmp_path = self.root.join(format!("{}.tmp", name));

        let envelope = Artifact {
            version: FORMAT_VERSION,
            generation,
            payload,
        };

        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create artifact: {}", tmp_path.display()))?;
        serde_json::to_writer(&file, &envelope)
            .with_context(|| format!("Failed to write artifact: {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync artifact: {}", tmp_path.display()))?;

        fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to commit artifact: {}", path.display()))?;

        Ok(())
    }
}
