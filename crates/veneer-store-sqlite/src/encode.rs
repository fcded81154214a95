//! Encoding and decoding helpers between queue entries and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings with a fixed nanosecond precision, so that
//! equal instants always encode to equal strings. Targets and the expected
//! assertion are stored as compact JSON.

use chrono::{DateTime, SecondsFormat, Utc};
use veneer_core::{
  entity::{Category, InvalidationTarget},
  reconcile::{Expected, ReconciliationEntry},
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── JSON columns ────────────────────────────────────────────────────────────

pub fn encode_targets(targets: &[InvalidationTarget]) -> Result<String> {
  Ok(serde_json::to_string(targets)?)
}

pub fn decode_targets(s: &str) -> Result<Vec<InvalidationTarget>> {
  Ok(serde_json::from_str(s)?)
}

pub fn encode_expected(expected: &Expected) -> Result<String> {
  Ok(serde_json::to_string(expected)?)
}

pub fn decode_expected(s: &str) -> Result<Expected> {
  Ok(serde_json::from_str(s)?)
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Read a row's `seq` and its decoded entry. A row that fails to decode
/// yields an `Err` entry rather than failing the whole query.
pub fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, Result<ReconciliationEntry>)> {
  let seq = row.get(0)?;
  let entry = RawEntry::from_row(row)
    .map_err(|e| Error::Database(e.into()))
    .and_then(RawEntry::into_entry);
  Ok((seq, entry))
}

/// Raw values read directly from a `reconciliations` row, after its `seq`.
pub struct RawEntry {
  pub id:              String,
  pub category:        String,
  pub targets:         String,
  pub expected:        Option<String>,
  pub attempt_index:   u32,
  pub created_at:      String,
  pub next_attempt_at: String,
}

impl RawEntry {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:              row.get(1)?,
      category:        row.get(2)?,
      targets:         row.get(3)?,
      expected:        row.get(4)?,
      attempt_index:   row.get(5)?,
      created_at:      row.get(6)?,
      next_attempt_at: row.get(7)?,
    })
  }

  pub fn into_entry(self) -> Result<ReconciliationEntry> {
    Ok(ReconciliationEntry {
      id:                   self.id,
      category:             Category::new(self.category),
      invalidation_targets: decode_targets(&self.targets)?,
      expected:             self.expected.as_deref().map(decode_expected).transpose()?,
      attempt_index:        self.attempt_index,
      created_at:           decode_dt(&self.created_at)?,
      next_attempt_at:      decode_dt(&self.next_attempt_at)?,
    })
  }
}

/// Column values ready to bind into an INSERT.
pub struct EncodedEntry {
  pub id:              String,
  pub category:        String,
  pub targets:         String,
  pub expected:        Option<String>,
  pub attempt_index:   u32,
  pub created_at:      String,
  pub next_attempt_at: String,
}

impl EncodedEntry {
  pub fn new(entry: &ReconciliationEntry) -> Result<Self> {
    Ok(Self {
      id:              entry.id.clone(),
      category:        entry.category.as_str().to_owned(),
      targets:         encode_targets(&entry.invalidation_targets)?,
      expected:        entry.expected.as_ref().map(encode_expected).transpose()?,
      attempt_index:   entry.attempt_index,
      created_at:      encode_dt(entry.created_at),
      next_attempt_at: encode_dt(entry.next_attempt_at),
    })
  }
}
