//! larder-core - Retrieval-augmented answering over a recipe collection
//!
//! Provides the pieces of the answering pipeline:
//! - Document chunking with bounded overlap
//! - An in-memory vector index with snapshot persistence
//! - Embedding and generation provider abstraction (OpenAI-compatible HTTP)
//! - Retrieval, context assembly, and the query orchestrator
//! - Corpus ingestion and the HTTP query server
//!
//! ## Primary API
//!
//! Build an index with [`IndexBuilder`], then answer queries through
//! [`QueryPipeline`].

// Public modules
pub mod chunk;
pub mod config;
pub mod context;
pub mod index;
pub mod ingest;
pub mod pipeline;
pub mod provider;
pub mod retrieve;
pub mod server;
pub mod types;

// Public exports
pub use chunk::Chunker;
pub use config::Config;
pub use context::ContextAssembler;
pub use index::VectorIndex;
pub use ingest::{load_documents, BuildReport, IndexBuilder};
pub use pipeline::{Phase, PipelineError, QueryPipeline};
pub use retrieve::Retriever;
pub use server::Server;

// Provider exports
pub use provider::{EmbedError, Embedder, GenerateError, GenerationRequest, Generator, HttpProvider};

// Core types
pub use types::{Answer, Chunk, ContextWindow, Document, MetadataFilter, Query, ScoredChunk};
