//! # rag-harness
//!
//! A retrieval-augmented question answering pipeline over uploaded
//! documents.
//!
//! Uploaded files (PDF, plain text, DOCX, SRT subtitles) are split into
//! overlapping segments, embedded, and held in an exact cosine-similarity
//! index. A question retrieves the best segments, which are composed into a
//! prompt under a restricted or unrestricted policy and answered by a
//! language model. The answer comes back together with the segments it cites.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌────────────────┐
//! │ SourceFiles │──▶│   Chunker   │──▶│ EmbeddingIndex │──▶ SQLite
//! │ pdf/txt/... │   │ extract+split│  │  cosine, exact │
//! └─────────────┘   └─────────────┘   └───────┬────────┘
//!                                             │ search(k)
//!                   ┌──────────────┐   ┌──────▼─────────┐
//!   QueryResult ◀───│ Generation   │◀──│ RetrievalChain │◀── question
//!                   │ Client (LLM) │   │ prompt policy  │
//!                   └──────────────┘   └────────────────┘
//! ```
//!
//! [`pipeline::PipelineController`] owns one corpus and sequences the two
//! flows.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and classification |
//! | [`models`] | Core data types |
//! | [`extract`] | Per-format text extractors |
//! | [`chunk`] | Overlap-aware text splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | In-memory embedding index |
//! | [`store`] | SQLite persistence |
//! | [`retrieval`] | Context retrieval and prompt composition |
//! | [`generation`] | Language-model client |
//! | [`pipeline`] | Ingest/answer controller |
//! | [`logging`] | Tracing subscriber setup |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index;
pub mod logging;
pub mod models;
pub mod pipeline;
mod provider;
pub mod retrieval;
pub mod store;

pub use error::{ErrorClass, RagError, Result};
pub use pipeline::PipelineController;
