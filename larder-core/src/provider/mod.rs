//! Model provider abstraction layer.
//!
//! The pipeline consumes embedding and generation as black-box capabilities
//! behind one-method traits, so backends can be swapped (or mocked in tests)
//! without touching retrieval or orchestration.

mod types;
pub mod http;

// Re-export common types
pub use types::{
    EmbedError,
    Embedder,
    EmbedResult,
    GenerateError,
    GenerateResult,
    GenerationRequest,
    Generator,
};

// Re-export provider implementations
pub use http::HttpProvider;
