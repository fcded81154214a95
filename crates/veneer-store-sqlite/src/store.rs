//! [`SqliteQueueStore`]: the SQLite implementation of [`QueueStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::warn;
use veneer_core::{queue::QueueStore, reconcile::ReconciliationEntry};

use crate::{
  Error, Result,
  encode::{EncodedEntry, encode_dt, read_row},
  schema::SCHEMA,
};

const SELECT_ENTRIES: &str = "SELECT seq, id, category, targets, expected, attempt_index, created_at, next_attempt_at
   FROM reconciliations
   ORDER BY seq";

/// A durable reconciliation queue backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteQueueStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteQueueStore {
  /// Open (or create) a queue at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory queue, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── QueueStore impl ─────────────────────────────────────────────────────────

impl QueueStore for SqliteQueueStore {
  type Error = Error;

  /// Rows that no longer decode can never be drained or expired, so they are
  /// logged and deleted rather than failing every later load.
  async fn load_all(&self) -> Result<Vec<ReconciliationEntry>> {
    let entries = self
      .conn
      .call(|conn| {
        let rows = {
          let mut stmt = conn.prepare(SELECT_ENTRIES)?;
          stmt
            .query_map([], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut entries = Vec::with_capacity(rows.len());
        for (seq, entry) in rows {
          match entry {
            Ok(entry) => entries.push(entry),
            Err(e) => {
              warn!(seq, error = %e, "dropping undecodable reconciliation row");
              conn.execute("DELETE FROM reconciliations WHERE seq = ?1", [seq])?;
            }
          }
        }
        Ok(entries)
      })
      .await?;

    Ok(entries)
  }

  async fn upsert(&self, entry: ReconciliationEntry) -> Result<()> {
    let row = EncodedEntry::new(&entry)?;

    self
      .conn
      .call(move |conn| {
        // REPLACE deletes the conflicting row first, so the new row takes a
        // fresh `seq`.
        conn.execute(
          "INSERT OR REPLACE INTO reconciliations (
             id, category, targets, expected,
             attempt_index, created_at, next_attempt_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![
            row.id,
            row.category,
            row.targets,
            row.expected,
            row.attempt_index,
            row.created_at,
            row.next_attempt_at,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn remove(&self, id: &str) -> Result<bool> {
    let id = id.to_owned();

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM reconciliations WHERE id = ?1",
          rusqlite::params![id],
        )?)
      })
      .await?;
    Ok(changed > 0)
  }

  async fn reschedule(
    &self,
    id:              &str,
    created_at:      DateTime<Utc>,
    attempt_index:   u32,
    next_attempt_at: DateTime<Utc>,
  ) -> Result<bool> {
    let id      = id.to_owned();
    let created = encode_dt(created_at);
    let next    = encode_dt(next_attempt_at);

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE reconciliations
           SET attempt_index = ?3, next_attempt_at = ?4
           WHERE id = ?1 AND created_at = ?2",
          rusqlite::params![id, created, attempt_index, next],
        )?)
      })
      .await?;
    Ok(changed > 0)
  }

  async fn retire(&self, id: &str, created_at: DateTime<Utc>) -> Result<bool> {
    let id      = id.to_owned();
    let created = encode_dt(created_at);

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM reconciliations WHERE id = ?1 AND created_at = ?2",
          rusqlite::params![id, created],
        )?)
      })
      .await?;
    Ok(changed > 0)
  }

  async fn count(&self) -> Result<usize> {
    let n: i64 = self
      .conn
      .call(|conn| {
        Ok(conn.query_row("SELECT COUNT(*) FROM reconciliations", [], |r| r.get(0))?)
      })
      .await?;
    Ok(n.max(0) as usize)
  }
}
