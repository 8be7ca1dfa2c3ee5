//! Corpus ingestion: load documents, chunk them, embed the chunks, and
//! insert them into the index one document at a time.
//!
//! Failure isolation is per document. If any chunk of a document fails to
//! embed, none of that document's chunks reach the index and the document is
//! recorded in the build report; the rest of the corpus is unaffected. Under
//! `strict` the first failed document aborts the build instead.

use crate::chunk::Chunker;
use crate::index::{IndexError, VectorIndex};
use crate::provider::{EmbedError, Embedder};
use crate::types::{Chunk, Document};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("cannot read documents from {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("malformed document file {path}: {reason}")]
    Parse { path: String, reason: String },

    /// Raised in strict mode only; lenient builds record the failure in the
    /// report instead.
    #[error("document {doc_id} failed to embed: {source}")]
    Embed {
        doc_id: String,
        #[source]
        source: EmbedError,
    },

    #[error(transparent)]
    Index(#[from] IndexError),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// One document that did not make it into the index.
#[derive(Debug, Clone, Serialize)]
pub struct BuildFailure {
    pub doc_id: String,
    pub error: String,
}

/// Outcome of a corpus build.
#[derive(Debug, Default, Serialize)]
pub struct BuildReport {
    /// Documents fully indexed.
    pub documents: usize,
    /// Chunks inserted across all indexed documents.
    pub chunks: usize,
    pub failures: Vec<BuildFailure>,
}

impl BuildReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reads a JSON array of documents from disk.
///
/// # Errors
///
/// [`IngestError::Read`] when the file cannot be read,
/// [`IngestError::Parse`] when it is not a JSON array of documents.
pub fn load_documents(path: &Path) -> Result<Vec<Document>> {
    let raw = std::fs::read_to_string(path).map_err(|e| IngestError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let documents: Vec<Document> = serde_json::from_str(&raw).map_err(|e| IngestError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(documents)
}

/// Chunks, embeds, and indexes documents.
pub struct IndexBuilder {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    concurrency: usize,
    strict: bool,
}

impl IndexBuilder {
    pub fn new(chunker: Chunker, embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>) -> Self {
        Self {
            chunker,
            embedder,
            index,
            concurrency: 4,
            strict: false,
        }
    }

    /// Number of chunk embeddings in flight at once within a document.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Abort the build on the first document that fails instead of
    /// recording and continuing.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Builds the index from `documents`, one insert batch per document.
    ///
    /// # Errors
    ///
    /// A dimension mismatch on insert is a configuration problem, not a
    /// per-document one, and always aborts. Embedding failures abort only
    /// in strict mode.
    pub async fn build(&self, documents: &[Document]) -> Result<BuildReport> {
        let mut report = BuildReport::default();

        for document in documents {
            match self.embed_document(document).await {
                Ok(batch) => {
                    let inserted = batch.len();
                    self.index.insert(batch)?;
                    report.documents += 1;
                    report.chunks += inserted;
                    debug!(doc_id = %document.id, chunks = inserted, "indexed document");
                }
                Err(source) => {
                    warn!(
                        doc_id = %document.id,
                        error = %source,
                        "embedding failed, document will not be indexed"
                    );
                    if self.strict {
                        return Err(IngestError::Embed {
                            doc_id: document.id.clone(),
                            source,
                        });
                    }
                    report.failures.push(BuildFailure {
                        doc_id: document.id.clone(),
                        error: source.to_string(),
                    });
                }
            }
        }

        info!(
            documents = report.documents,
            chunks = report.chunks,
            failures = report.failures.len(),
            "corpus build complete"
        );
        Ok(report)
    }

    /// Embeds every chunk of one document, keeping chunk order. Any failed
    /// chunk fails the whole document.
    async fn embed_document(
        &self,
        document: &Document,
    ) -> std::result::Result<Vec<(Chunk, Vec<f32>)>, EmbedError> {
        let chunks = self.chunker.chunk(document);

        let mut embedded = stream::iter(chunks)
            .map(|chunk| {
                let embedder = Arc::clone(&self.embedder);
                async move {
                    let vector = embedder.embed(&chunk.text).await?;
                    Ok::<_, EmbedError>((chunk, vector))
                }
            })
            .buffered(self.concurrency);

        let mut batch = Vec::new();
        while let Some(item) = embedded.next().await {
            batch.push(item?);
        }
        Ok(batch)
    }
}
