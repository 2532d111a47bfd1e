//! Store adapters for vigil.
//!
//! The daemon consumes two narrow interfaces: an append-only time-series
//! store for metric samples and a semantic store for issues, knowledge, and
//! the system registry. Both ship with a SQLite-backed adapter (and an
//! in-memory constructor for tests); swapping in an external server means
//! implementing the same trait.

pub mod metrics;
pub mod semantic;

pub use metrics::{Aggregate, MetricsStore, SqliteMetricsStore};
pub use semantic::{KnowledgeEntry, SemanticStore, SqliteSemanticStore, SystemRecord};

/// Errors surfaced by the store adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
