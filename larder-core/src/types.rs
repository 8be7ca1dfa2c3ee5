//! Core data model shared across the pipeline.
//!
//! Everything here is a plain value type: documents enter the system once at
//! build time, chunks live inside the index, and the query-side types
//! ([`Query`], [`ScoredChunk`], [`ContextWindow`], [`Answer`]) are ephemeral
//! per-request data.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A source document as provided by the prepared dataset.
///
/// Documents are immutable once ingested: the build phase chunks and embeds
/// them, after which only their chunks exist in the index. Removal happens
/// per document id, never in place.
///
/// # Example
///
/// ```
/// use larder_core::types::Document;
///
/// let doc = Document::new("rec_42", "Minestrone", "Dice the onions...")
///     .with_metadata("category", "soup")
///     .with_metadata("cuisine", "italian");
/// assert_eq!(doc.metadata.get("category").map(String::as_str), Some("soup"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            text: text.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A contiguous segment of a document produced by the chunker.
///
/// Chunk ids are `<doc_id>#<ordinal>`. Adjacent chunks of the same document
/// share a bounded overlap and link to each other through `prev`/`next`.
/// The document's metadata (and title, under the `title` key) is denormalized
/// onto every chunk so the index can filter without a document lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub ordinal: usize,
    pub text: String,
    #[serde(default)]
    pub prev: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Chunk {
    /// Builds the canonical chunk id for a document position.
    pub fn id_for(doc_id: &str, ordinal: usize) -> String {
        format!("{}#{}", doc_id, ordinal)
    }

    /// Number of characters in the chunk text (the unit the context budget
    /// is measured in).
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Equality predicate over chunk metadata.
///
/// All listed fields must match for a chunk to pass. An empty filter matches
/// everything. Filters are evaluated by the index before ranking, so a
/// filtered search over few matches returns fewer than `k` results rather
/// than erroring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub fields: HashMap<String, String>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        self.fields
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

/// A query against the indexed corpus.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub text: String,
    pub filter: Option<MetadataFilter>,
    /// Per-request override of the configured `top_k`.
    pub top_k: Option<usize>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            filter: None,
            top_k: None,
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

/// A chunk paired with its retrieval score.
///
/// Results are ordered by descending score; equal scores fall back to
/// insertion order (`seq`), earliest first, so rankings are stable across
/// runs.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
    /// Insertion sequence number assigned by the index.
    pub seq: u64,
}

/// The ordered, budgeted set of chunks handed to generation.
///
/// Invariants upheld by the assembler: total text length never exceeds the
/// budget, no chunk id appears twice, and chunks of one document keep their
/// ordinal order relative to each other.
#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    pub chunks: Vec<Chunk>,
    pub total_chars: usize,
    /// Chunks skipped because they were individually larger than the budget.
    pub dropped_oversized: usize,
}

impl ContextWindow {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_ids(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.id.clone()).collect()
    }
}

/// The final answer returned by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Chunk ids the model cited, restricted to chunks actually in the
    /// context window. Order of first mention, no duplicates.
    pub citations: Vec<String>,
    /// Chunk ids that made up the context window.
    pub context: Vec<String>,
    /// False when generation ran without any retrieved context.
    pub grounded: bool,
}
