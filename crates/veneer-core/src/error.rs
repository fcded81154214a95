//! Error types for `veneer-core`.
//!
//! Unreliable confirmations (duplicate events, lost confirmations, failed
//! authoritative lookups, malformed enqueues) are absorbed internally and never
//! show up here. What remains is configuration and durable-queue failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("queue store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Wrap a backend error from a [`crate::queue::QueueStore`].
  pub fn store(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
