//! Common types for model providers.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the embedding service.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    #[error("embedding request timed out")]
    Timeout,

    #[error("embedding response invalid: {0}")]
    InvalidResponse(String),
}

pub type EmbedResult<T> = std::result::Result<T, EmbedError>;

/// Errors from the language-model service.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generation rate limited")]
    RateLimited,

    #[error("generation request timed out")]
    Timeout,

    #[error("generation service unavailable: {0}")]
    Unavailable(String),

    #[error("generation response invalid: {0}")]
    InvalidResponse(String),
}

impl GenerateError {
    /// Whether a retry could plausibly succeed. A malformed response is a
    /// contract violation and is never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerateError::RateLimited | GenerateError::Timeout | GenerateError::Unavailable(_)
        )
    }
}

pub type GenerateResult<T> = std::result::Result<T, GenerateError>;

/// Capability to turn text into a fixed-dimension vector.
///
/// Implementations must be substitutable: the pipeline holds an
/// `Arc<dyn Embedder>` and never assumes a particular backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds one text. The returned vector's dimension is the embedding
    /// model's, which the index validates on insert and search.
    async fn embed(&self, text: &str) -> EmbedResult<Vec<f32>>;
}

/// Capability to generate an answer from an assembled prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produces the completion text for a request.
    async fn generate(&self, request: &GenerationRequest) -> GenerateResult<String>;
}

/// A fully rendered generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Standing instructions (persona, citation rules).
    pub system: String,
    /// The user-turn prompt with context and question already substituted.
    pub prompt: String,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
        }
    }
}
