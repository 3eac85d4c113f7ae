//! # Audit Intel Core
//!
//! Shared, I/O-free logic for Audit Intel: the document data model, error
//! kinds, the structure-aware chunker, the embedding provider trait and the
//! reference-counted embedding cache, the vector index abstraction with an
//! in-memory implementation, and the deterministic ranking rules used by
//! retrieval.
//!
//! This crate contains no tokio, sqlx, filesystem, or network dependencies.
//! The `audit-intel` application crate wires these pieces to real extractors,
//! embedding backends and vector stores.

pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod search;

pub use error::{Error, Result};
