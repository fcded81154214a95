//! Error type for `veneer-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),
}

impl From<Error> for veneer_core::Error {
  fn from(e: Error) -> Self { veneer_core::Error::store(e) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
