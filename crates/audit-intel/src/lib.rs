//! # Audit Intel
//!
//! **Ingestion and retrieval core for audit documents.**
//!
//! Audit Intel turns uploaded audit documents (PDF, Word, PowerPoint, Excel,
//! text) into chunked, embedded, vector-indexed records and answers
//! similarity queries over them, keeping every document version's records
//! consistent with its lifecycle state.
//!
//! ## Architecture
//!
//! ```text
//! upload ─► ┌────────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────┐
//!           │  Extract   │──▶│  Chunk   │──▶│  Embed      │──▶│  Vector  │
//!           │ PDF/OOXML  │   │ (core)   │   │ cache+retry │   │  index   │
//!           └────────────┘   └──────────┘   └─────────────┘   └────┬─────┘
//!                                                                   │
//!             query ─► embed ─► search ─► visibility ─► rank ◄──────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`extract`] | Text extraction and cleanup per MIME type |
//! | [`embedding`] | Embedding providers: OpenAI, Ollama, local fastembed, hash |
//! | [`pipeline`] | Batched, cached, retrying embedding of chunks |
//! | [`index`] | SQLite and Qdrant vector index adapters |
//! | [`catalog`] | Durable document and chunk catalog |
//! | [`uploads`] | Raw upload bytes kept for re-ingestion |
//! | [`worker`] | Bounded ingestion worker pool with cancellation |
//! | [`lifecycle`] | Document state machine and ingestion jobs |
//! | [`retrieve`] | Query embedding, filtering and ranking |
//! | [`engine`] | Wiring everything from a [`config::Config`] |
//! | [`db`] / [`migrate`] | SQLite pool with WAL and idempotent schema |
//! | [`scan`] | File collection for the CLI |
//! | [`retry`] | Timeout and exponential backoff helper |
//!
//! The I/O-free pieces (data model, chunker, cache, index trait, ranking)
//! live in the `audit-intel-core` crate.

pub mod catalog;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod extract;
pub mod index;
pub mod lifecycle;
pub mod migrate;
pub mod pipeline;
pub mod retrieve;
pub mod retry;
pub mod scan;
pub mod uploads;
pub mod worker;

pub use audit_intel_core::{Error, Result};
pub use engine::{Engine, EngineBuilder};
pub use lifecycle::{DocumentManager, UploadReceipt, UploadRequest};
pub use retrieve::{Query, RetrievedChunk};
