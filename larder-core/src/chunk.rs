//! Sliding-window text chunking.
//!
//! Documents are split into fixed-size overlapping windows so that no
//! passage is cut off from its surrounding context entirely. Sizes are
//! measured in characters, not bytes, so multi-byte text chunks the same
//! way regardless of encoding weight.

use crate::types::{Chunk, Document};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("invalid chunking parameters: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ChunkError>;

/// Splits documents into overlapping chunks.
///
/// Chunking is deterministic and pure: the same document with the same
/// parameters always produces byte-identical chunks, which keeps chunk ids
/// stable across rebuilds.
#[derive(Debug, Clone)]
pub struct Chunker {
    max_size: usize,
    overlap: usize,
}

impl Chunker {
    /// Creates a chunker with a window of `max_size` characters advancing by
    /// `max_size - overlap` each step.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::InvalidConfig`] when `overlap >= max_size` (the
    /// window would never advance) or `max_size` is zero.
    pub fn new(max_size: usize, overlap: usize) -> Result<Self> {
        if max_size == 0 {
            return Err(ChunkError::InvalidConfig(
                "max_size must be greater than zero".to_string(),
            ));
        }
        if overlap >= max_size {
            return Err(ChunkError::InvalidConfig(format!(
                "overlap ({}) must be smaller than max_size ({})",
                overlap, max_size
            )));
        }
        Ok(Self { max_size, overlap })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Splits a document into linked, ordinal-numbered chunks.
    ///
    /// An empty document yields no chunks. A document shorter than the
    /// window yields exactly one. Each chunk carries the document's
    /// metadata (plus its title under the `title` key) so the index can
    /// filter without a separate document store.
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let pieces = split_text(&document.text, self.max_size, self.overlap);
        let count = pieces.len();

        pieces
            .into_iter()
            .enumerate()
            .map(|(ordinal, text)| {
                let mut metadata = document.metadata.clone();
                if !document.title.is_empty() {
                    metadata.insert("title".to_string(), document.title.clone());
                }
                Chunk {
                    id: Chunk::id_for(&document.id, ordinal),
                    doc_id: document.id.clone(),
                    ordinal,
                    text,
                    prev: ordinal
                        .checked_sub(1)
                        .map(|p| Chunk::id_for(&document.id, p)),
                    next: (ordinal + 1 < count).then(|| Chunk::id_for(&document.id, ordinal + 1)),
                    metadata,
                }
            })
            .collect()
    }
}

/// Core sliding-window split over character positions.
///
/// Every chunk except the last is exactly `max_size` characters; each chunk
/// after the first repeats the previous chunk's final `overlap` characters.
fn split_text(text: &str, max_size: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    // Byte offset of every character boundary, with the end offset as a
    // sentinel, so windows can be sliced in char space without scanning.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = boundaries.len() - 1;

    if total <= max_size {
        return vec![text.to_string()];
    }

    let step = max_size - overlap;
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < total {
        let end = (start + max_size).min(total);
        pieces.push(text[boundaries[start]..boundaries[end]].to_string());
        if end == total {
            break;
        }
        start += step;
    }

    pieces
}

/// Inverse of chunking: rebuilds the original text from ordinal-ordered
/// chunks by dropping each non-initial chunk's leading overlap.
pub fn reassemble(chunks: &[Chunk], overlap: usize) -> String {
    let mut text = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            text.push_str(&chunk.text);
        } else {
            text.extend(chunk.text.chars().skip(overlap));
        }
    }
    text
}
