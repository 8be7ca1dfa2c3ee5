//! In-process vector index with snapshot persistence.
//!
//! The index stores chunk embeddings in memory and searches them with an
//! exact cosine-similarity scan. Exact search keeps ranking fully
//! deterministic: scores descend strictly and equal scores resolve by
//! insertion order, which approximate backends cannot promise.
//!
//! # Concurrency
//!
//! State lives behind `RwLock<Arc<Snapshot>>`. Readers clone the `Arc` and
//! scan without holding the lock, so searches never block each other and a
//! search that started before a write completes runs against the state it
//! began with. Writers build a replacement snapshot and publish it with a
//! bumped version; the lock is only ever held for the pointer swap.

use crate::chunk::reassemble;
use crate::types::{Chunk, MetadataFilter, ScoredChunk};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Bumped whenever the on-disk layout changes incompatibly.
const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("failed to load index snapshot from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("failed to save index snapshot to {path}: {reason}")]
    Save { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// One indexed chunk: its text record, embedding, and insertion sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    seq: u64,
    chunk: Chunk,
    vector: Vec<f32>,
}

/// An immutable published state of the index.
#[derive(Debug, Default)]
struct Snapshot {
    /// Process-local publish counter, bumped on every successful write.
    version: u64,
    next_seq: u64,
    entries: Vec<IndexEntry>,
}

/// On-disk snapshot layout.
///
/// Carries the chunking parameters used at build time so the query phase
/// can reassemble document text and report provenance.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    format: u32,
    dimension: usize,
    chunk_size: usize,
    overlap: usize,
    next_seq: u64,
    entries: Vec<IndexEntry>,
}

/// Exact nearest-neighbor index over chunk embeddings.
///
/// The linear scan is O(n · d) per search, which is the right trade at
/// recipe-corpus scale and the only way to honor deterministic tie-breaks.
#[derive(Debug)]
pub struct VectorIndex {
    dimension: usize,
    chunk_size: usize,
    overlap: usize,
    state: RwLock<Arc<Snapshot>>,
}

impl VectorIndex {
    /// Creates an empty index accepting vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            chunk_size: 0,
            overlap: 0,
            state: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Records the chunking parameters the corpus was built with. They are
    /// persisted into snapshots and used to reassemble document text.
    pub fn with_chunking(mut self, chunk_size: usize, overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.overlap = overlap;
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Checks the index against an externally configured dimension, so a
    /// snapshot built with a different embedding model fails once up front
    /// instead of erroring on every search.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] with `got` set to the
    /// index's own dimension.
    pub fn ensure_dimension(&self, expected: usize) -> Result<()> {
        if self.dimension != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                got: self.dimension,
            });
        }
        Ok(())
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.current().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().entries.is_empty()
    }

    /// Publish count of the current snapshot.
    pub fn version(&self) -> u64 {
        self.current().version
    }

    fn current(&self) -> Arc<Snapshot> {
        self.state.read().unwrap().clone()
    }

    /// Inserts a batch of chunks with their embeddings.
    ///
    /// The whole batch is validated before anything is published: a single
    /// wrong-dimension vector rejects the batch and leaves the index
    /// untouched. Re-inserting a document replaces it wholesale: every
    /// existing entry of a document named in the batch is dropped first, so
    /// a document that re-chunks to fewer pieces leaves no stale ordinals
    /// behind, and its replacement entries carry fresh insertion sequences.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] naming the first offending
    /// vector's dimension.
    pub fn insert(&self, batch: Vec<(Chunk, Vec<f32>)>) -> Result<()> {
        for (_, vector) in &batch {
            if vector.len() != self.dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dimension,
                    got: vector.len(),
                });
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write().unwrap();
        let current = state.clone();

        let incoming: HashSet<&str> = batch.iter().map(|(c, _)| c.doc_id.as_str()).collect();
        let mut entries: Vec<IndexEntry> = current
            .entries
            .iter()
            .filter(|e| !incoming.contains(e.chunk.doc_id.as_str()))
            .cloned()
            .collect();
        let replaced = current.entries.len() - entries.len();

        let mut next_seq = current.next_seq;
        for (chunk, vector) in batch {
            entries.push(IndexEntry {
                seq: next_seq,
                chunk,
                vector,
            });
            next_seq += 1;
        }

        let version = current.version + 1;
        debug!(
            version,
            total = entries.len(),
            replaced,
            "published index snapshot"
        );
        *state = Arc::new(Snapshot {
            version,
            next_seq,
            entries,
        });
        Ok(())
    }

    /// Removes every chunk belonging to a document.
    ///
    /// All of the document's entries disappear in one publish; concurrent
    /// readers see either all of them or none. Returns the number of chunks
    /// removed, zero when the document was not indexed.
    pub fn remove(&self, doc_id: &str) -> usize {
        let mut state = self.state.write().unwrap();
        let current = state.clone();

        let kept: Vec<IndexEntry> = current
            .entries
            .iter()
            .filter(|e| e.chunk.doc_id != doc_id)
            .cloned()
            .collect();
        let removed = current.entries.len() - kept.len();
        if removed == 0 {
            return 0;
        }

        info!(doc_id, removed, "removed document from index");
        *state = Arc::new(Snapshot {
            version: current.version + 1,
            next_seq: current.next_seq,
            entries: kept,
        });
        removed
    }

    /// Searches for the `k` most similar chunks.
    ///
    /// The metadata filter is applied before ranking, so a narrow filter
    /// returns fewer than `k` results rather than erroring. Results are
    /// ordered by descending cosine similarity; equal scores fall back to
    /// insertion order, earliest first.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] when the query vector's
    /// dimension does not match the index.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: query.len(),
            });
        }

        let snapshot = self.current();
        let mut results: Vec<ScoredChunk> = snapshot
            .entries
            .iter()
            .filter(|entry| {
                filter
                    .map(|f| f.matches(&entry.chunk.metadata))
                    .unwrap_or(true)
            })
            .map(|entry| ScoredChunk {
                chunk: entry.chunk.clone(),
                score: cosine_similarity(query, &entry.vector),
                seq: entry.seq,
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });
        results.truncate(k);
        Ok(results)
    }

    /// All chunks of a document in ordinal order.
    pub fn chunks_of(&self, doc_id: &str) -> Vec<Chunk> {
        let snapshot = self.current();
        let mut chunks: Vec<Chunk> = snapshot
            .entries
            .iter()
            .filter(|e| e.chunk.doc_id == doc_id)
            .map(|e| e.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.ordinal);
        chunks
    }

    /// Reassembles a document's full text from its indexed chunks using the
    /// overlap recorded at build time. Returns `None` for unknown ids.
    pub fn document_text(&self, doc_id: &str) -> Option<String> {
        let chunks = self.chunks_of(doc_id);
        if chunks.is_empty() {
            return None;
        }
        Some(reassemble(&chunks, self.overlap))
    }

    /// Persists the current snapshot as JSON, atomically (temp file then
    /// rename), so a crash mid-save never corrupts the previous snapshot.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.current();
        let file = SnapshotFile {
            format: SNAPSHOT_FORMAT,
            dimension: self.dimension,
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            next_seq: snapshot.next_seq,
            entries: snapshot.entries.clone(),
        };

        let save_err = |reason: String| IndexError::Save {
            path: path.display().to_string(),
            reason,
        };
        let json = serde_json::to_string(&file).map_err(|e| save_err(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| save_err(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| save_err(e.to_string()))?;

        info!(
            path = %path.display(),
            chunks = snapshot.entries.len(),
            "saved index snapshot"
        );
        Ok(())
    }

    /// Loads an index from a snapshot file.
    ///
    /// The snapshot is validated before anything is usable: an unsupported
    /// format, unreadable file, or internally inconsistent entry fails the
    /// whole load. There is no partially loaded index.
    pub fn load(path: &Path) -> Result<Self> {
        let load_err = |reason: String| IndexError::Load {
            path: path.display().to_string(),
            reason,
        };

        let contents = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let file: SnapshotFile =
            serde_json::from_str(&contents).map_err(|e| load_err(e.to_string()))?;

        if file.format != SNAPSHOT_FORMAT {
            return Err(load_err(format!(
                "unsupported snapshot format {} (expected {})",
                file.format, SNAPSHOT_FORMAT
            )));
        }
        for entry in &file.entries {
            if entry.vector.len() != file.dimension {
                return Err(load_err(format!(
                    "entry {} has dimension {} but snapshot declares {}",
                    entry.chunk.id,
                    entry.vector.len(),
                    file.dimension
                )));
            }
        }

        info!(
            path = %path.display(),
            chunks = file.entries.len(),
            dimension = file.dimension,
            "loaded index snapshot"
        );
        Ok(Self {
            dimension: file.dimension,
            chunk_size: file.chunk_size,
            overlap: file.overlap,
            state: RwLock::new(Arc::new(Snapshot {
                version: 0,
                next_seq: file.next_seq,
                entries: file.entries,
            })),
        })
    }
}

/// Computes cosine similarity between two vectors.
///
/// Returns values from -1.0 (opposite) to 1.0 (identical). Mismatched
/// lengths or zero magnitudes score 0.0 rather than erroring.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc_id: &str, ordinal: usize, text: &str) -> Chunk {
        Chunk {
            id: Chunk::id_for(doc_id, ordinal),
            doc_id: doc_id.to_string(),
            ordinal,
            text: text.to_string(),
            prev: None,
            next: None,
            metadata: std::collections::HashMap::new(),
        }
    }

    fn chunk_with(doc_id: &str, ordinal: usize, key: &str, value: &str) -> Chunk {
        let mut c = chunk(doc_id, ordinal, "text");
        c.metadata.insert(key.to_string(), value.to_string());
        c
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_insert_and_search_ranks_exact_match_first() {
        let index = VectorIndex::new(3);
        index
            .insert(vec![
                (chunk("a", 0, "onion soup"), vec![1.0, 0.0, 0.0]),
                (chunk("b", 0, "beef stew"), vec![0.0, 1.0, 0.0]),
                (chunk("c", 0, "fruit salad"), vec![0.6, 0.8, 0.0]),
            ])
            .unwrap();

        let results = index.search(&[1.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.id, "a#0");
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn test_batch_insert_is_atomic_on_dimension_mismatch() {
        let index = VectorIndex::new(3);
        let err = index
            .insert(vec![
                (chunk("a", 0, "fine"), vec![1.0, 0.0, 0.0]),
                (chunk("a", 1, "short"), vec![1.0, 0.0]),
            ])
            .unwrap_err();

        match err {
            IndexError::DimensionMismatch { expected, got } => {
                assert_eq!(expected, 3);
                assert_eq!(got, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing from the batch may be visible.
        assert_eq!(index.len(), 0);
        assert!(index.search(&[1.0, 0.0, 0.0], 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_query_dimension_is_checked() {
        let index = VectorIndex::new(3);
        assert!(matches!(
            index.search(&[1.0, 0.0], 5, None),
            Err(IndexError::DimensionMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn test_ensure_dimension_rejects_mismatched_configuration() {
        let index = VectorIndex::new(2);
        assert!(index.ensure_dimension(2).is_ok());
        assert!(matches!(
            index.ensure_dimension(3),
            Err(IndexError::DimensionMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn test_equal_scores_break_ties_by_insertion_order() {
        let index = VectorIndex::new(2);
        index
            .insert(vec![
                (chunk("first", 0, "alpha"), vec![1.0, 0.0]),
                (chunk("second", 0, "beta"), vec![1.0, 0.0]),
            ])
            .unwrap();

        let results = index.search(&[1.0, 0.0], 2, None).unwrap();
        assert_eq!(results[0].chunk.doc_id, "first");
        assert_eq!(results[1].chunk.doc_id, "second");
        assert_eq!(results[0].score, results[1].score);
    }

    #[test]
    fn test_filter_is_applied_before_ranking() {
        let index = VectorIndex::new(2);
        index
            .insert(vec![
                (chunk_with("a", 0, "category", "soup"), vec![0.5, 0.5]),
                (chunk_with("b", 0, "category", "dessert"), vec![1.0, 0.0]),
            ])
            .unwrap();

        // The dessert chunk scores higher, but the filter removes it from
        // consideration entirely rather than occupying a rank.
        let filter = MetadataFilter::new().with("category", "soup");
        let results = index.search(&[1.0, 0.0], 5, Some(&filter)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.doc_id, "a");
    }

    #[test]
    fn test_filter_matching_nothing_is_empty_not_error() {
        let index = VectorIndex::new(2);
        index
            .insert(vec![(chunk_with("a", 0, "category", "soup"), vec![1.0, 0.0])])
            .unwrap();

        let filter = MetadataFilter::new().with("category", "bread");
        let results = index.search(&[1.0, 0.0], 5, Some(&filter)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_remove_drops_all_of_a_document() {
        let index = VectorIndex::new(2);
        index
            .insert(vec![
                (chunk("a", 0, "one"), vec![1.0, 0.0]),
                (chunk("a", 1, "two"), vec![0.0, 1.0]),
                (chunk("b", 0, "three"), vec![0.5, 0.5]),
            ])
            .unwrap();

        assert_eq!(index.remove("a"), 2);
        assert_eq!(index.len(), 1);
        let results = index.search(&[1.0, 0.0], 5, None).unwrap();
        assert!(results.iter().all(|r| r.chunk.doc_id == "b"));

        assert_eq!(index.remove("missing"), 0);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_reinserting_chunk_id_replaces_entry() {
        let index = VectorIndex::new(2);
        index
            .insert(vec![(chunk("a", 0, "old"), vec![1.0, 0.0])])
            .unwrap();
        index
            .insert(vec![(chunk("a", 0, "new"), vec![0.0, 1.0])])
            .unwrap();

        assert_eq!(index.len(), 1);
        let results = index.search(&[0.0, 1.0], 1, None).unwrap();
        assert_eq!(results[0].chunk.text, "new");
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_reinserting_shrunk_document_drops_stale_ordinals() {
        let index = VectorIndex::new(2);
        index
            .insert(vec![
                (chunk("a", 0, "one"), vec![1.0, 0.0]),
                (chunk("a", 1, "two"), vec![0.0, 1.0]),
                (chunk("a", 2, "three"), vec![0.5, 0.5]),
                (chunk("b", 0, "other"), vec![0.5, 0.5]),
            ])
            .unwrap();

        // The document now chunks to a single piece; the old higher
        // ordinals must not survive the re-insert.
        index
            .insert(vec![(chunk("a", 0, "condensed"), vec![1.0, 0.0])])
            .unwrap();

        let ids: Vec<String> = index.chunks_of("a").iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec!["a#0"]);
        assert_eq!(index.document_text("a").as_deref(), Some("condensed"));
        assert_eq!(index.len(), 2);
        assert_eq!(index.chunks_of("b").len(), 1);
    }

    #[test]
    fn test_version_bumps_on_every_publish() {
        let index = VectorIndex::new(2);
        assert_eq!(index.version(), 0);
        index
            .insert(vec![(chunk("a", 0, "one"), vec![1.0, 0.0])])
            .unwrap();
        assert_eq!(index.version(), 1);
        index.remove("a");
        assert_eq!(index.version(), 2);
        // A no-op remove publishes nothing.
        index.remove("a");
        assert_eq!(index.version(), 2);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = VectorIndex::new(2).with_chunking(100, 10);
        index
            .insert(vec![
                (chunk("a", 0, "first"), vec![1.0, 0.0]),
                (chunk("b", 0, "second"), vec![0.0, 1.0]),
            ])
            .unwrap();
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.dimension(), 2);

        let results = loaded.search(&[1.0, 0.0], 1, None).unwrap();
        assert_eq!(results[0].chunk.id, "a#0");

        // Sequence numbers survive the round trip, so tie-breaks stay stable.
        let all = loaded.search(&[1.0, 1.0], 2, None).unwrap();
        assert_eq!(all[0].chunk.id, "a#0");
    }

    #[test]
    fn test_load_rejects_missing_and_corrupt_snapshots() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("nope.json");
        assert!(matches!(
            VectorIndex::load(&missing),
            Err(IndexError::Load { .. })
        ));

        let corrupt = dir.path().join("bad.json");
        std::fs::write(&corrupt, "not json at all").unwrap();
        assert!(matches!(
            VectorIndex::load(&corrupt),
            Err(IndexError::Load { .. })
        ));

        let wrong_format = dir.path().join("format.json");
        std::fs::write(
            &wrong_format,
            r#"{"format": 99, "dimension": 2, "chunk_size": 0, "overlap": 0, "next_seq": 0, "entries": []}"#,
        )
        .unwrap();
        let err = VectorIndex::load(&wrong_format).unwrap_err();
        assert!(err.to_string().contains("unsupported snapshot format"));
    }

    #[test]
    fn test_document_text_reassembles_original() {
        use crate::chunk::Chunker;
        use crate::types::Document;

        let text = "Roast the peppers until the skins blister, then peel and slice them thin.";
        let chunker = Chunker::new(20, 6).unwrap();
        let chunks = chunker.chunk(&Document::new("rec", "Peppers", text));

        let index = VectorIndex::new(2).with_chunking(20, 6);
        let batch = chunks.into_iter().map(|c| (c, vec![1.0, 0.0])).collect();
        index.insert(batch).unwrap();

        assert_eq!(index.document_text("rec").as_deref(), Some(text));
        assert_eq!(index.document_text("unknown"), None);
    }
}
