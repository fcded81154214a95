//! SQL schema for the Veneer SQLite queue.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- One row per outstanding reconciliation. Re-enqueueing an id replaces the
-- row, which also gives it a fresh `seq` at the end of the order.
CREATE TABLE IF NOT EXISTS reconciliations (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    category        TEXT NOT NULL,
    targets         TEXT NOT NULL,   -- JSON array of lookup descriptors
    expected        TEXT,            -- JSON-encoded Expected or NULL
    attempt_index   INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,   -- RFC 3339 UTC, nanosecond precision
    next_attempt_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS reconciliations_due_idx ON reconciliations(next_attempt_at);

PRAGMA user_version = 1;
";
