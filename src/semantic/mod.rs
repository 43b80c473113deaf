//! Sentence embeddings and the note similarity index.
//!
//! - `sanitize`: note text to clean sentences
//! - `embeddings`: sentence embedding strategies (local model or remote delegate)
//! - `matrix`: N×D embedding matrix and its blob encoding
//! - `index`: in-memory nearest-neighbour index with its row to note mapping
//! - `service`: keeps the index in sync with the store and the reference service

pub mod embeddings;
pub mod index;
pub mod matrix;
pub mod sanitize;
mod service;

pub use embeddings::{build_embedder, Embedder, EmbeddingError};
pub use matrix::Embeddings;
pub use service::{IndexPhase, IndexStatus, IndexSynchronizer, SyncError};
