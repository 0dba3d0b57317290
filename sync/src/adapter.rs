//! The generic table adapter.
//!
//! Push, pull and realtime-apply are written once, parameterized by
//! [`TableConfig`]. The adapter holds no state of its own; all side effects
//! go through the store and gateway handles in [`SyncContext`]. Any behavior
//! a table needs that the config cannot express belongs in a new config
//! field, not a bespoke code path.

use crate::error::Result;
use crate::gateway::{ChangeEvent, GatewayError, RemoteGateway};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use tempo_store::{cmp_timestamps, FieldMap, LocalStore, OutboxOp, StoredRow, TableConfig};
use tracing::{debug, warn};

/// Handles and session scope for one adapter invocation.
pub struct SyncContext<'a> {
    pub store: &'a LocalStore,
    pub gateway: &'a dyn RemoteGateway,
    pub user_id: &'a str,
}

/// Accounting for one table's push pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Rows acknowledged by the server (upserts and deletes).
    pub pushed: usize,
    /// Rows skipped because the server copy was strictly newer.
    pub server_newer: usize,
    /// Rows parked in the outbox after a retryable failure.
    pub enqueued: usize,
    /// Rows evicted after an authorization or malformed-id rejection.
    pub purged: usize,
    /// Rows that failed locally (store errors); the pass continues.
    pub failed: usize,
}

/// Accounting for one table's pull pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Remote rows written locally with `synced=1`.
    pub applied: usize,
    /// Remote rows skipped because a local edit or pending delete wins.
    pub skipped: usize,
    /// Local rows removed by the authoritative-delete sweep.
    pub swept: usize,
}

/// Outcome of applying one realtime delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedEvent {
    /// Remote value written locally.
    Upserted,
    /// Local row hard-deleted.
    Deleted,
    /// A local unsynced edit exists; the delta was not applied and the
    /// caller should schedule a re-push.
    DeferredConflict,
    /// Nothing to do (no id, unknown row, append-only delete).
    Ignored,
}

enum RowOutcome {
    Pushed,
    ServerNewer,
    Enqueued,
    Purged,
}

/// Push every unsynced row of one table, strictly in storage order. Row
/// failures are isolated; a single row never aborts the table pass.
pub async fn push_table(ctx: &SyncContext<'_>, config: &TableConfig) -> Result<PushReport> {
    let unsynced = ctx.store.get_all_unsynced(config)?;
    let mut report = PushReport::default();

    for row in unsynced {
        let id = row.key(config);
        match push_row(ctx, config, &row).await {
            Ok(RowOutcome::Pushed) => report.pushed += 1,
            Ok(RowOutcome::ServerNewer) => report.server_newer += 1,
            Ok(RowOutcome::Enqueued) => report.enqueued += 1,
            Ok(RowOutcome::Purged) => report.purged += 1,
            Err(err) => {
                warn!(table = config.local_name, id = %id, error = %err, "row push failed");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

async fn push_row(
    ctx: &SyncContext<'_>,
    config: &TableConfig,
    row: &StoredRow,
) -> Result<RowOutcome> {
    let id = row.key(config);

    // Pending soft-delete: replicate the tombstone as a remote delete.
    if config.soft_delete && row.deleted {
        return match ctx
            .gateway
            .delete(config.remote_name, config.primary_key, &id)
            .await
        {
            // A row the server never saw deletes trivially.
            Ok(()) | Err(GatewayError::NotFound) => {
                ctx.store.update_sync_flag(config, &id, true)?;
                ctx.store.remove_outbox_for_record(config.local_name, &id)?;
                Ok(RowOutcome::Pushed)
            }
            Err(err) if is_purge_rejection(config, &err) => {
                purge_local(ctx, config, &id)?;
                Ok(RowOutcome::Purged)
            }
            Err(err) => {
                debug!(table = config.local_name, id = %id, error = %err, "parking delete in outbox");
                ctx.store
                    .enqueue_outbox(config.local_name, OutboxOp::Delete, &id, None)?;
                Ok(RowOutcome::Enqueued)
            }
        };
    }

    // Last-write-wins guard. Append-only tables skip it: their rows are
    // immutable, so there is nothing to lose to.
    if !config.append_only {
        match ctx
            .gateway
            .fetch_updated_at(config.remote_name, config.primary_key, &id)
            .await
        {
            Ok(None) => {}
            Ok(Some(remote_updated)) => {
                if cmp_timestamps(&remote_updated, row.updated_at()) == Ordering::Greater {
                    // The server copy is strictly newer; ours is stale.
                    // Ties fall through: the local push proceeds.
                    ctx.store.update_sync_flag(config, &id, true)?;
                    return Ok(RowOutcome::ServerNewer);
                }
            }
            Err(err) if is_purge_rejection(config, &err) => {
                purge_local(ctx, config, &id)?;
                return Ok(RowOutcome::Purged);
            }
            Err(err) => {
                debug!(table = config.local_name, id = %id, error = %err, "parking upsert in outbox");
                enqueue_upsert(ctx, config, row)?;
                return Ok(RowOutcome::Enqueued);
            }
        }
    }

    let payload = project_for_push(config, row, ctx.user_id);
    match ctx
        .gateway
        .upsert(config.remote_name, vec![payload.clone()], config.on_conflict)
        .await
    {
        Ok(()) => {
            ctx.store.update_sync_flag(config, &id, true)?;
            ctx.store.remove_outbox_for_record(config.local_name, &id)?;
            Ok(RowOutcome::Pushed)
        }
        Err(err) if is_purge_rejection(config, &err) => {
            purge_local(ctx, config, &id)?;
            Ok(RowOutcome::Purged)
        }
        Err(err) => {
            debug!(table = config.local_name, id = %id, error = %err, "parking upsert in outbox");
            let encoded = Value::Object(payload).to_string();
            ctx.store.enqueue_outbox(
                config.local_name,
                OutboxOp::Upsert,
                &id,
                Some(&encoded),
            )?;
            Ok(RowOutcome::Enqueued)
        }
    }
}

/// Pull the server state of one table and merge it under last-write-wins,
/// then sweep rows the server no longer has.
pub async fn pull_table(ctx: &SyncContext<'_>, config: &TableConfig) -> Result<PullReport> {
    let scope = config.user_scoped.then_some(ctx.user_id);
    let remote_rows = ctx.gateway.fetch_rows(config.remote_name, scope).await?;

    let mut report = PullReport::default();
    let mut server_ids: HashSet<String> = HashSet::with_capacity(remote_rows.len());

    for remote_fields in remote_rows {
        let Some(id) = remote_fields
            .get(config.primary_key)
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            warn!(table = config.remote_name, "dropping remote row without id");
            continue;
        };
        server_ids.insert(id.clone());

        let remote_updated = remote_fields
            .get("updated_at")
            .and_then(Value::as_str)
            .unwrap_or("");

        if let Some(local) = ctx.store.get_by_id(config, &id, true)? {
            if local.deleted && !local.synced {
                // Pending local delete beats any remote update.
                report.skipped += 1;
                continue;
            }
            if cmp_timestamps(local.updated_at(), remote_updated) == Ordering::Greater {
                report.skipped += 1;
                continue;
            }
        }

        let row = remote_to_stored(config, remote_fields);
        match ctx.store.upsert_row(config, &row, true) {
            Ok(()) => report.applied += 1,
            Err(err) => {
                warn!(table = config.local_name, id = %id, error = %err, "failed to store remote row");
            }
        }
    }

    if !config.append_only {
        report.swept = ctx.store.delete_missing(config, &server_ids)?;
    }
    Ok(report)
}

/// Apply one realtime delta against local state.
pub async fn apply_remote_event(
    ctx: &SyncContext<'_>,
    config: &TableConfig,
    event: ChangeEvent,
) -> Result<AppliedEvent> {
    let Some(id) = event.record_id(config.primary_key) else {
        return Ok(AppliedEvent::Ignored);
    };

    match event {
        ChangeEvent::Insert { new } | ChangeEvent::Update { new, .. } => {
            if !config.append_only {
                if let Some(local) = ctx.store.get_by_id(config, &id, true)? {
                    if !local.synced {
                        debug!(
                            table = config.local_name,
                            id = %id, "deferring remote change over unsynced local edit"
                        );
                        return Ok(AppliedEvent::DeferredConflict);
                    }
                }
            }
            let row = remote_to_stored(config, new);
            ctx.store.upsert_row(config, &row, true)?;
            Ok(AppliedEvent::Upserted)
        }
        ChangeEvent::Delete { .. } => {
            if config.append_only {
                return Ok(AppliedEvent::Ignored);
            }
            let existed = ctx.store.hard_delete(config, &id)?;
            ctx.store.remove_outbox_for_record(config.local_name, &id)?;
            Ok(if existed {
                AppliedEvent::Deleted
            } else {
                AppliedEvent::Ignored
            })
        }
    }
}

/// Build the remote payload for a row: the configured projection with the
/// shape hook applied and the session user injected on user-scoped tables.
/// `synced` and `deleted` never leave the device.
pub(crate) fn project_for_push(
    config: &TableConfig,
    row: &StoredRow,
    user_id: &str,
) -> FieldMap {
    let mut payload = FieldMap::new();
    for col in config.columns {
        let value = row.fields.get(*col).cloned().unwrap_or(Value::Null);
        payload.insert((*col).to_string(), value);
    }
    if let Some(hook) = config.local_to_remote {
        hook(&mut payload);
    }
    if config.user_scoped {
        payload.insert("user_id".into(), Value::String(user_id.to_string()));
    }
    payload
}

/// Convert a remote row into local shape: strip the user scope, apply the
/// shape hook, and keep only configured columns.
pub(crate) fn remote_to_stored(config: &TableConfig, mut fields: FieldMap) -> StoredRow {
    if config.user_scoped {
        fields.remove("user_id");
    }
    if let Some(hook) = config.remote_to_local {
        hook(&mut fields);
    }
    let mut projected = FieldMap::new();
    for col in config.columns {
        if let Some(value) = fields.remove(*col) {
            projected.insert((*col).to_string(), value);
        }
    }
    StoredRow {
        fields: projected,
        synced: true,
        deleted: false,
    }
}

/// An authorization rejection always evicts the local copy; a malformed-id
/// rejection only on tables that opted in (legacy non-UUID ids).
pub(crate) fn is_purge_rejection(config: &TableConfig, err: &GatewayError) -> bool {
    match err {
        GatewayError::PermissionDenied(_) => true,
        GatewayError::MalformedIdentifier(_) => config.evict_on_malformed_id,
        _ => false,
    }
}

/// Evict a row the remote refuses to own, together with anything the outbox
/// still holds for it.
pub(crate) fn purge_local(ctx: &SyncContext<'_>, config: &TableConfig, id: &str) -> Result<()> {
    warn!(
        table = config.local_name,
        id = %id, "remote rejected row ownership, purging local copy"
    );
    ctx.store.hard_delete(config, id)?;
    ctx.store.remove_outbox_for_record(config.local_name, id)?;
    Ok(())
}

fn enqueue_upsert(ctx: &SyncContext<'_>, config: &TableConfig, row: &StoredRow) -> Result<()> {
    let id = row.key(config);
    let payload = Value::Object(project_for_push(config, row, ctx.user_id)).to_string();
    ctx.store
        .enqueue_outbox(config.local_name, OutboxOp::Upsert, &id, Some(&payload))?;
    Ok(())
}
