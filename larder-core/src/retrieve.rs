//! Query-side retrieval: embed the query, search the index, re-rank.
//!
//! Retrieval has no retry policy of its own. Embedding failures propagate to
//! the orchestrator, which owns backoff, so a single query never hides how
//! many provider calls it made.

use crate::config::RetrievalConfig;
use crate::index::{IndexError, VectorIndex};
use crate::provider::{EmbedError, Embedder};
use crate::types::{Query, ScoredChunk};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbedError),

    #[error("index search failed: {0}")]
    Index(#[from] IndexError),

    #[error("document not indexed: {0}")]
    UnknownDocument(String),
}

pub type Result<T> = std::result::Result<T, RetrieveError>;

/// Retrieves the chunks most relevant to a query.
///
/// Vector search pulls a candidate pool larger than `top_k`; an optional
/// lexical re-rank then reorders the pool before truncation. Re-ranking can
/// only reorder: it never introduces a chunk vector search did not return.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Runs one retrieval pass for the query.
    ///
    /// Returns at most `top_k` chunks (the query's override when positive,
    /// otherwise the configured default), best first. An empty index
    /// short-circuits to an empty result without calling the embedder.
    ///
    /// # Errors
    ///
    /// Embedding failures surface as [`RetrieveError::Embedding`] untouched;
    /// retrying is the orchestrator's decision, not ours.
    pub async fn retrieve(&self, query: &Query) -> Result<Vec<ScoredChunk>> {
        if self.index.is_empty() {
            debug!("index is empty, skipping retrieval");
            return Ok(Vec::new());
        }

        // The configuration forbids a zero top_k; a zero override counts
        // as unset.
        let top_k = query.top_k.filter(|&k| k > 0).unwrap_or(self.config.top_k);
        let pool = self.config.candidates.max(top_k);

        let query_vector = self.embedder.embed(&query.text).await?;
        let mut candidates = self
            .index
            .search(&query_vector, pool, query.filter.as_ref())?;
        debug!(
            candidates = candidates.len(),
            pool, top_k, "vector search complete"
        );

        if self.config.rerank_weight > 0.0 {
            self.rerank(&query.text, &mut candidates);
        }

        candidates.truncate(top_k);
        Ok(candidates)
    }

    /// Resolves a document id to query text, for "more like this" queries
    /// that use an indexed document's own text as the question.
    pub fn query_text_for_document(&self, doc_id: &str) -> Result<String> {
        self.index
            .document_text(doc_id)
            .ok_or_else(|| RetrieveError::UnknownDocument(doc_id.to_string()))
    }

    /// Blends lexical query-token overlap into the vector scores and
    /// re-sorts the pool. At weight 1.0 ranking is purely lexical, at 0.0
    /// this is never called.
    fn rerank(&self, query_text: &str, candidates: &mut [ScoredChunk]) {
        let query_tokens = tokenize(query_text);
        if query_tokens.is_empty() {
            return;
        }

        let weight = self.config.rerank_weight;
        for candidate in candidates.iter_mut() {
            let overlap = lexical_overlap(&query_tokens, &candidate.chunk.text);
            candidate.score = (1.0 - weight) * candidate.score + weight * overlap;
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fraction of query tokens that appear in the chunk text.
fn lexical_overlap(query_tokens: &HashSet<String>, text: &str) -> f32 {
    let chunk_tokens = tokenize(text);
    let shared = query_tokens.intersection(&chunk_tokens).count();
    shared as f32 / query_tokens.len() as f32
}
