//! Outbox drain: replay parked operations with exponential back-off.
//!
//! The payload stays an opaque JSON string until this pass decodes it with
//! the table's configuration. Entries that reach the retry ceiling are
//! dead-lettered: dropped with a warning, leaving the row's `synced` flag
//! untouched so a later push can start over.

use crate::adapter::{is_purge_rejection, purge_local, SyncContext};
use crate::error::Result;
use crate::gateway::GatewayError;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use std::time::Duration;
use tempo_store::{now_iso, table_by_local_name, FieldMap, OutboxEntry, OutboxOp};
use tracing::{debug, warn};

/// An entry is dropped once it has failed this many replays.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
/// First retry lands one second out.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Retries never wait longer than this.
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Accounting for one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries replayed successfully and removed.
    pub replayed: usize,
    /// Entries dropped at the retry ceiling.
    pub dead_lettered: usize,
    /// Entries whose record was purged after a remote rejection.
    pub purged: usize,
    /// Entries that failed again and were rescheduled.
    pub failed: usize,
    /// Message of the last replay failure in this pass.
    pub last_error: Option<String>,
}

/// Delay before the next replay of an entry that has already failed
/// `retry_count` times: `base * 2^retry_count`, capped.
pub fn compute_backoff(retry_count: u32) -> Duration {
    let exponent = retry_count.min(16);
    let secs = BACKOFF_BASE.as_secs().saturating_mul(1u64 << exponent);
    Duration::from_secs(secs.min(BACKOFF_CAP.as_secs()))
}

fn next_retry_stamp(retry_count: u32) -> String {
    let delay = ChronoDuration::from_std(compute_backoff(retry_count))
        .unwrap_or_else(|_| ChronoDuration::seconds(BACKOFF_CAP.as_secs() as i64));
    (Utc::now() + delay).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Replay every due outbox entry, oldest effective time first.
pub async fn drain_outbox(ctx: &SyncContext<'_>) -> Result<DrainReport> {
    let now = now_iso();
    let entries = ctx.store.due_outbox(&now)?;
    let mut report = DrainReport::default();

    for entry in entries {
        if entry.retry_count >= MAX_RETRY_ATTEMPTS {
            warn!(
                table = %entry.table_name,
                record = %entry.record_id,
                attempts = entry.retry_count,
                "dead-lettering outbox entry"
            );
            ctx.store.remove_outbox(entry.id)?;
            report.dead_lettered += 1;
            if report.last_error.is_none() {
                report.last_error = Some(format!(
                    "dropped {} {} for {} after {} attempts",
                    entry.op.as_str(),
                    entry.table_name,
                    entry.record_id,
                    entry.retry_count
                ));
            }
            continue;
        }

        let Some(config) = table_by_local_name(&entry.table_name) else {
            warn!(table = %entry.table_name, "dropping outbox entry for unknown table");
            ctx.store.remove_outbox(entry.id)?;
            continue;
        };

        match replay(ctx, config, &entry).await {
            Ok(()) => {
                ctx.store.remove_outbox(entry.id)?;
                // The row now matches the server; tombstones become
                // confirmed and get collected by the cleanup pass.
                ctx.store
                    .update_sync_flag(config, &entry.record_id, true)?;
                report.replayed += 1;
            }
            Err(ReplayError::Gateway(err)) if is_purge_rejection(config, &err) => {
                purge_local(ctx, config, &entry.record_id)?;
                report.purged += 1;
            }
            Err(ReplayError::Gateway(err)) => {
                let next = next_retry_stamp(entry.retry_count);
                debug!(
                    table = %entry.table_name,
                    record = %entry.record_id,
                    retry_count = entry.retry_count + 1,
                    next_retry_at = %next,
                    error = %err,
                    "outbox replay failed, rescheduling"
                );
                ctx.store.increment_outbox_retry(entry.id, &next)?;
                report.failed += 1;
                report.last_error = Some(err.to_string());
            }
            Err(ReplayError::Poisoned(message)) => {
                // Undecodable payloads can never replay; drop them.
                warn!(
                    table = %entry.table_name,
                    record = %entry.record_id,
                    error = %message,
                    "dropping undecodable outbox entry"
                );
                ctx.store.remove_outbox(entry.id)?;
            }
        }
    }

    Ok(report)
}

enum ReplayError {
    Gateway(GatewayError),
    Poisoned(String),
}

async fn replay(
    ctx: &SyncContext<'_>,
    config: &tempo_store::TableConfig,
    entry: &OutboxEntry,
) -> std::result::Result<(), ReplayError> {
    match entry.op {
        OutboxOp::Upsert => {
            let raw = entry
                .payload
                .as_deref()
                .ok_or_else(|| ReplayError::Poisoned("missing payload".into()))?;
            let fields: FieldMap = serde_json::from_str(raw)
                .map_err(|err| ReplayError::Poisoned(err.to_string()))?;
            ctx.gateway
                .upsert(config.remote_name, vec![fields], config.on_conflict)
                .await
                .map_err(ReplayError::Gateway)
        }
        OutboxOp::Delete => match ctx
            .gateway
            .delete(config.remote_name, config.primary_key, &entry.record_id)
            .await
        {
            Ok(()) | Err(GatewayError::NotFound) => Ok(()),
            Err(err) => Err(ReplayError::Gateway(err)),
        },
    }
}
