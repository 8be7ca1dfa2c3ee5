//! Context assembly: pick retrieved chunks into a budgeted window.
//!
//! Selection is greedy in retrieval-rank order, but the final window is
//! re-ordered for the prompt: documents appear in the order of their
//! best-ranked chunk, and a document's own chunks always appear in ordinal
//! order, even when retrieval scored a later chunk higher. That keeps
//! stitched-together excerpts readable instead of shuffled.

use crate::types::{ContextWindow, ScoredChunk};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Assembles ranked chunks into a context window under a character budget.
///
/// Assembly is total: nothing here can fail. Chunks that cannot fit are
/// skipped (and counted when they could never fit), never errors.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    budget_chars: usize,
}

impl ContextAssembler {
    pub fn new(budget_chars: usize) -> Self {
        Self { budget_chars }
    }

    /// Selects chunks greedily by rank until the budget is spent.
    ///
    /// A chunk that does not fit the remaining budget is passed over and
    /// later, smaller chunks may still be taken. A chunk larger than the
    /// entire budget can never be placed; it is skipped, logged, and counted
    /// in `dropped_oversized`. Duplicate chunk ids (possible when several
    /// retrieval passes feed one assembly) are kept only at their best rank.
    pub fn assemble(&self, ranked: &[ScoredChunk]) -> ContextWindow {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut selected: Vec<(usize, &ScoredChunk)> = Vec::new();
        let mut total_chars = 0;
        let mut dropped_oversized = 0;

        for (rank, scored) in ranked.iter().enumerate() {
            if !seen.insert(&scored.chunk.id) {
                continue;
            }
            let len = scored.chunk.char_len();
            if len > self.budget_chars {
                warn!(
                    chunk = %scored.chunk.id,
                    chars = len,
                    budget = self.budget_chars,
                    "chunk larger than the whole context budget, dropping"
                );
                dropped_oversized += 1;
                continue;
            }
            if total_chars + len > self.budget_chars {
                debug!(
                    chunk = %scored.chunk.id,
                    chars = len,
                    remaining = self.budget_chars - total_chars,
                    "chunk does not fit remaining budget, passing over"
                );
                continue;
            }
            total_chars += len;
            selected.push((rank, scored));
        }

        // Best rank per document decides where that document's block sits.
        let mut doc_best: HashMap<&str, usize> = HashMap::new();
        for (rank, scored) in &selected {
            let entry = doc_best.entry(scored.chunk.doc_id.as_str()).or_insert(*rank);
            if *rank < *entry {
                *entry = *rank;
            }
        }
        selected.sort_by_key(|(_, scored)| {
            (doc_best[scored.chunk.doc_id.as_str()], scored.chunk.ordinal)
        });

        ContextWindow {
            chunks: selected.into_iter().map(|(_, s)| s.chunk.clone()).collect(),
            total_chars,
            dropped_oversized,
        }
    }
}
