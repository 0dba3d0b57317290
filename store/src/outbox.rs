//! The durable retry outbox.
//!
//! Operations that fail their inline attempt are parked here and replayed by
//! the sync engine's drain pass. The payload is an opaque JSON string at
//! rest; it is decoded only at drain time, using the table configuration.

use crate::error::{Result, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Operation kind recorded in an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxOp {
    Upsert,
    Delete,
}

impl OutboxOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOp::Upsert => "upsert",
            OutboxOp::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upsert" => Some(OutboxOp::Upsert),
            "delete" => Some(OutboxOp::Delete),
            _ => None,
        }
    }
}

/// One parked operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub table_name: String,
    pub op: OutboxOp,
    pub record_id: String,
    pub payload: Option<String>,
    pub created_at: String,
    pub retry_count: u32,
    pub next_retry_at: Option<String>,
}

const COLUMNS: &str = "id, table_name, op, record_id, payload, created_at, retry_count, next_retry_at";

/// Park an operation. At most one entry exists per `(table, op, record)`;
/// re-enqueueing refreshes the payload but preserves the retry state so that
/// repeated inline failures cannot reset the dead-letter countdown.
pub(crate) fn enqueue(
    conn: &Connection,
    table_name: &str,
    op: OutboxOp,
    record_id: &str,
    payload: Option<&str>,
    now: &str,
) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM sync_outbox WHERE table_name = ? AND op = ? AND record_id = ?",
            params![table_name, op.as_str(), record_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::read)?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE sync_outbox SET payload = ? WHERE id = ?",
            params![payload, id],
        )
        .map_err(StoreError::write)?;
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO sync_outbox (table_name, op, record_id, payload, created_at, retry_count)
         VALUES (?, ?, ?, ?, ?, 0)",
        params![table_name, op.as_str(), record_id, payload, now],
    )
    .map_err(StoreError::write)?;
    Ok(conn.last_insert_rowid())
}

/// Entries ready for replay: `next_retry_at` unset or in the past, ordered by
/// `COALESCE(next_retry_at, created_at) ASC, id ASC`.
pub(crate) fn due_entries(conn: &Connection, now: &str) -> Result<Vec<OutboxEntry>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM sync_outbox
         WHERE next_retry_at IS NULL OR next_retry_at <= ?
         ORDER BY COALESCE(next_retry_at, created_at) ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql).map_err(StoreError::read)?;
    let entries = stmt
        .query_map(params![now], read_entry)
        .map_err(StoreError::read)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::read)?;
    Ok(entries)
}

pub(crate) fn len(conn: &Connection) -> Result<usize> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM sync_outbox", [], |row| row.get(0))
        .map_err(StoreError::read)?;
    Ok(count as usize)
}

pub(crate) fn remove(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM sync_outbox WHERE id = ?", params![id])
        .map_err(StoreError::write)?;
    Ok(())
}

/// Drop every parked operation for a record, in any table. Used when the
/// record itself is purged or has been pushed successfully inline.
pub(crate) fn remove_for_record(conn: &Connection, table_name: &str, record_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM sync_outbox WHERE table_name = ? AND record_id = ?",
        params![table_name, record_id],
    )
    .map_err(StoreError::write)?;
    Ok(())
}

pub(crate) fn increment_retry(conn: &Connection, id: i64, next_retry_at: &str) -> Result<()> {
    conn.execute(
        "UPDATE sync_outbox SET retry_count = retry_count + 1, next_retry_at = ? WHERE id = ?",
        params![next_retry_at, id],
    )
    .map_err(StoreError::write)?;
    Ok(())
}

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let op: String = row.get(2)?;
    Ok(OutboxEntry {
        id: row.get(0)?,
        table_name: row.get(1)?,
        op: OutboxOp::parse(&op).unwrap_or(OutboxOp::Upsert),
        record_id: row.get(3)?,
        payload: row.get(4)?,
        created_at: row.get(5)?,
        retry_count: row.get::<_, i64>(6)? as u32,
        next_retry_at: row.get(7)?,
    })
}
