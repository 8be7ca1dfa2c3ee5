//! Answer orchestration: the retrieve → assemble → generate state machine.
//!
//! Every request walks the same path:
//!
//! ```text
//! Pending → Retrieving → Assembling → Generating → Succeeded
//!                │                         │
//!                └────────── Failed ───────┘
//! ```
//!
//! Retrieval and generation calls are retried with bounded exponential
//! backoff; the attempt count and the backoff schedule are explicit state,
//! not hidden inside a client. One deadline covers the whole request: when
//! it expires the in-flight provider call is abandoned and the error names
//! the phase that was running. Failures are terminal states, never
//! panics, and a request can never end mid-phase.

use crate::config::Config;
use crate::context::ContextAssembler;
use crate::index::VectorIndex;
use crate::provider::{Embedder, GenerateError, GenerationRequest, Generator};
use crate::retrieve::{RetrieveError, Retriever};
use crate::types::{Answer, ContextWindow, Query, ScoredChunk};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Lifecycle phase of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Retrieving,
    Assembling,
    Generating,
    Succeeded,
    Failed,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Pending,
            1 => Phase::Retrieving,
            2 => Phase::Assembling,
            3 => Phase::Generating,
            4 => Phase::Succeeded,
            _ => Phase::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Retrieving => "retrieving",
            Phase::Assembling => "assembling",
            Phase::Generating => "generating",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase holder shared between a request future and its deadline arm, so a
/// timeout can report how far the request got.
struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn new() -> Self {
        Self(AtomicU8::new(Phase::Pending as u8))
    }

    fn set(&self, phase: Phase) {
        debug!(phase = %phase, "request phase");
        self.0.store(phase as u8, Ordering::SeqCst);
    }

    fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("retrieval failed after {attempts} attempts: {source}")]
    RetrievalExhausted {
        attempts: u32,
        #[source]
        source: RetrieveError,
    },

    #[error("generation failed after {attempts} attempts ({context_chunks} context chunks assembled): {source}")]
    GenerationExhausted {
        attempts: u32,
        /// How much context had been found before generation gave up.
        context_chunks: usize,
        #[source]
        source: GenerateError,
    },

    #[error("request timed out after {timeout_secs}s while {phase}")]
    Timeout { phase: Phase, timeout_secs: u64 },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Drives a query end to end: retrieval with retry, context assembly,
/// generation with retry, citation filtering.
///
/// The pipeline is cheap to share behind an `Arc`; all state it touches per
/// request lives on that request's stack, so concurrent `answer` calls
/// never contend with each other beyond the index's snapshot swap.
pub struct QueryPipeline {
    retriever: Retriever,
    assembler: ContextAssembler,
    generator: Arc<dyn Generator>,
    system_prompt: String,
    prompt_template: String,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    request_timeout: Duration,
}

impl QueryPipeline {
    /// Wires a pipeline from configuration and its collaborators.
    pub fn new(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        index: Arc<VectorIndex>,
    ) -> Self {
        Self {
            retriever: Retriever::new(embedder, index, config.retrieval.clone()),
            assembler: ContextAssembler::new(config.context.budget_chars),
            generator,
            system_prompt: config.generator.system_prompt.clone(),
            prompt_template: config.generator.prompt_template.clone(),
            max_attempts: config.retry.max_attempts,
            base_delay: Duration::from_millis(config.retry.base_delay_ms),
            max_delay: Duration::from_millis(config.retry.max_delay_ms),
            request_timeout: Duration::from_secs(config.retry.request_timeout_secs),
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Answers one query, running the full state machine under the request
    /// deadline.
    ///
    /// An empty context window is not a failure: generation still runs and
    /// the answer comes back with `grounded` unset.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::RetrievalExhausted`] after `max_attempts` failed
    ///   retrieval passes.
    /// - [`PipelineError::GenerationExhausted`] after `max_attempts` failed
    ///   generation calls, or immediately on a malformed response.
    /// - [`PipelineError::Timeout`] when the deadline expires, naming the
    ///   phase that was in flight.
    pub async fn answer(&self, query: Query) -> Result<Answer> {
        let phase = PhaseCell::new();

        match timeout(self.request_timeout, self.run(&query, &phase)).await {
            Ok(result) => result,
            Err(_) => {
                let reached = phase.get();
                phase.set(Phase::Failed);
                warn!(
                    phase = %reached,
                    timeout_secs = self.request_timeout.as_secs(),
                    "request deadline expired, abandoning in-flight call"
                );
                Err(PipelineError::Timeout {
                    phase: reached,
                    timeout_secs: self.request_timeout.as_secs(),
                })
            }
        }
    }

    async fn run(&self, query: &Query, phase: &PhaseCell) -> Result<Answer> {
        phase.set(Phase::Retrieving);
        let ranked = match self.retrieve_with_retry(query).await {
            Ok(ranked) => ranked,
            Err(err) => {
                phase.set(Phase::Failed);
                return Err(err);
            }
        };

        phase.set(Phase::Assembling);
        let window = self.assembler.assemble(&ranked);
        if window.is_empty() {
            debug!("context window is empty, answer will be ungrounded");
        }

        phase.set(Phase::Generating);
        let request = self.render_request(query, &window);
        let text = match self.generate_with_retry(&request, window.len()).await {
            Ok(text) => text,
            Err(err) => {
                phase.set(Phase::Failed);
                return Err(err);
            }
        };

        phase.set(Phase::Succeeded);
        let citations = parse_citations(&text, &window);
        let grounded = !window.is_empty();
        info!(
            context = window.len(),
            citations = citations.len(),
            grounded,
            "answer complete"
        );

        Ok(Answer {
            text,
            citations,
            context: window.chunk_ids(),
            grounded,
        })
    }

    /// Retrieval attempts with exponential backoff. Every retrieval error
    /// (embedder outage included) is worth retrying.
    async fn retrieve_with_retry(&self, query: &Query) -> Result<Vec<ScoredChunk>> {
        let mut attempt = 1;
        let mut delay = self.base_delay;

        loop {
            match self.retriever.retrieve(query).await {
                Ok(ranked) => return Ok(ranked),
                Err(source) => {
                    if attempt >= self.max_attempts {
                        return Err(PipelineError::RetrievalExhausted { attempts: attempt, source });
                    }
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "retrieval failed, backing off"
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Generation attempts with the same backoff schedule. A malformed
    /// response is terminal on the spot; only transient failures burn
    /// further attempts.
    async fn generate_with_retry(
        &self,
        request: &GenerationRequest,
        context_chunks: usize,
    ) -> Result<String> {
        let mut attempt = 1;
        let mut delay = self.base_delay;

        loop {
            match self.generator.generate(request).await {
                Ok(text) => return Ok(text),
                Err(source) => {
                    if !source.is_transient() || attempt >= self.max_attempts {
                        return Err(PipelineError::GenerationExhausted {
                            attempts: attempt,
                            context_chunks,
                            source,
                        });
                    }
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "generation failed, backing off"
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Renders the numbered-context prompt from the template's `{context}`
    /// and `{question}` slots.
    fn render_request(&self, query: &Query, window: &ContextWindow) -> GenerationRequest {
        let context = if window.is_empty() {
            "No relevant context was found.".to_string()
        } else {
            let mut blocks = String::new();
            for (i, chunk) in window.chunks.iter().enumerate() {
                blocks.push_str(&format!("[{}] {}\n", i + 1, chunk.text));
            }
            blocks
        };

        let prompt = self
            .prompt_template
            .replace("{context}", &context)
            .replace("{question}", &query.text);
        GenerationRequest::new(self.system_prompt.clone(), prompt)
    }
}

/// Extracts `[n]` citation markers and maps them to context chunk ids.
///
/// Markers outside `1..=len` are the model inventing sources; they are
/// dropped. Each cited chunk appears once, in order of first mention.
fn parse_citations(text: &str, window: &ContextWindow) -> Vec<String> {
    let mut citations = Vec::new();
    let mut seen = HashSet::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '[' {
            continue;
        }
        let mut digits = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() {
                digits.push(d);
                chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() || chars.peek() != Some(&']') {
            continue;
        }
        chars.next();

        if let Ok(n) = digits.parse::<usize>() {
            if (1..=window.len()).contains(&n) {
                let id = &window.chunks[n - 1].id;
                if seen.insert(id.clone()) {
                    citations.push(id.clone());
                }
            }
        }
    }

    citations
}
