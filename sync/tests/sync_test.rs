//! End-to-end sync scenarios over the in-memory gateway.

use serde_json::{json, Value};
use std::sync::Arc;
use tempo_store::{
    FieldMap, LocalStore, OutboxOp, StoredRow, HEALTH_SUMMARIES, MEAL_ENTRIES,
};
use tempo_sync::testing::InMemoryGateway;
use tempo_sync::{GatewayError, SyncEngine, SyncState};

const FAR_FUTURE: &str = "2999-01-01T00:00:00Z";

fn fields(value: Value) -> FieldMap {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn remote_meal(id: &str, calories: i64, updated_at: &str) -> FieldMap {
    fields(json!({
        "id": id,
        "name": "Meal",
        "calories": calories,
        "date": "2025-01-01",
        "updated_at": updated_at,
        "user_id": "user-1",
    }))
}

fn local_meal(id: &str, calories: i64, updated_at: &str) -> StoredRow {
    StoredRow::new(fields(json!({
        "id": id,
        "name": "Meal",
        "calories": calories,
        "date": "2025-01-01",
        "updated_at": updated_at,
    })))
}

async fn setup() -> (Arc<LocalStore>, Arc<InMemoryGateway>, SyncEngine) {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    store.ensure_initialized().await.unwrap();
    let gateway = Arc::new(InMemoryGateway::new());
    let engine = SyncEngine::new(store.clone(), gateway.clone(), "user-1");
    (store, gateway, engine)
}

/// `setup` plus one clean pass so the seeded catalogue is already replicated
/// and call-count deltas start from a steady state.
async fn setup_synced() -> (Arc<LocalStore>, Arc<InMemoryGateway>, SyncEngine) {
    let (store, gateway, engine) = setup().await;
    let summary = engine.full_sync().await;
    assert!(summary.is_clean(), "baseline sync failed: {:?}", summary);
    (store, gateway, engine)
}

fn clear_retry_stamps(store: &LocalStore) {
    store
        .conn()
        .execute("UPDATE sync_outbox SET next_retry_at = NULL", [])
        .unwrap();
}

// ============================================================================
// Seed scenarios
// ============================================================================

#[tokio::test]
async fn fresh_device_baseline() {
    let (store, gateway, engine) = setup().await;
    gateway.seed_row("meal_entries", remote_meal("m1", 100, "2025-01-01T00:00:00Z"));
    gateway.seed_row("meal_entries", remote_meal("m2", 200, "2025-01-02T00:00:00Z"));

    let summary = engine.full_sync().await;
    assert!(summary.is_clean());

    for (id, calories) in [("m1", 100), ("m2", 200)] {
        let row = store.get_by_id(&MEAL_ENTRIES, id, true).unwrap().unwrap();
        assert!(row.synced, "{id} should be synced");
        assert!(!row.deleted);
        assert_eq!(row.fields["calories"], json!(calories));
        // The user scope never lands in the local schema.
        assert!(!row.fields.contains_key("user_id"));
    }

    assert_eq!(store.outbox_len().unwrap(), 0);
    assert_eq!(engine.status().state, SyncState::Idle);
    assert_eq!(engine.queue_size(), 0);
}

#[tokio::test]
async fn offline_insert_then_sync() {
    let (store, gateway, engine) = setup_synced().await;

    store
        .write_local(
            &MEAL_ENTRIES,
            fields(json!({"id": "m3", "name": "Lunch", "calories": 300, "date": "2025-02-01"})),
        )
        .unwrap();

    gateway.set_offline(true);
    let summary = engine.full_sync().await;
    assert!(!summary.is_clean());

    // Inline push parked the row; the drain in the same pass failed once.
    let entries = store.due_outbox(FAR_FUTURE).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].op, OutboxOp::Upsert);
    assert_eq!(entries[0].record_id, "m3");
    assert_eq!(entries[0].retry_count, 1);
    assert!(entries[0].next_retry_at.is_some());
    assert_eq!(engine.queue_size(), 1);
    assert_eq!(engine.status().state, SyncState::Error);
    assert!(engine.status().last_error.is_some());

    gateway.set_offline(false);
    let summary = engine.full_sync().await;
    assert!(summary.is_clean());

    assert_eq!(store.outbox_len().unwrap(), 0);
    assert_eq!(engine.queue_size(), 0);
    let m3 = store.get_by_id(&MEAL_ENTRIES, "m3", false).unwrap().unwrap();
    assert!(m3.synced);

    let remote = gateway.row("meal_entries", "m3").unwrap();
    assert_eq!(remote["calories"], json!(300));
    assert_eq!(remote["user_id"], json!("user-1"));
    assert_eq!(engine.status().state, SyncState::Idle);
}

#[tokio::test]
async fn soft_delete_propagation() {
    let (store, gateway, engine) = setup().await;
    gateway.seed_row("meal_entries", remote_meal("m2", 200, "2025-01-02T00:00:00Z"));
    engine.full_sync().await;

    store.soft_delete(&MEAL_ENTRIES, "m2").unwrap();
    let summary = engine.full_sync().await;
    assert!(summary.is_clean());

    // Remote delete issued, local tombstone collected by cleanup.
    assert!(gateway.row("meal_entries", "m2").is_none());
    assert!(store.get_by_id(&MEAL_ENTRIES, "m2", true).unwrap().is_none());

    // Second pass is a remote no-op.
    let deletes = gateway.delete_calls();
    let upserts = gateway.upsert_calls();
    let summary = engine.full_sync().await;
    assert!(summary.is_clean());
    assert_eq!(summary.pushed, 0);
    assert_eq!(gateway.delete_calls(), deletes);
    assert_eq!(gateway.upsert_calls(), upserts);
}

#[tokio::test]
async fn authorization_purge() {
    let (store, gateway, engine) = setup_synced().await;

    // A foreign row somehow present locally.
    store
        .upsert_row(
            &MEAL_ENTRIES,
            &local_meal("x", 999, "2025-01-05T00:00:00Z"),
            false,
        )
        .unwrap();
    gateway.reject_record(
        "meal_entries",
        "x",
        GatewayError::PermissionDenied("row-level security".into()),
    );

    let summary = engine.full_sync().await;
    assert!(summary.is_clean());
    assert_eq!(summary.purged, 1);

    assert!(store.get_by_id(&MEAL_ENTRIES, "x", true).unwrap().is_none());
    assert_eq!(store.outbox_len().unwrap(), 0);
    assert_eq!(engine.status().state, SyncState::Idle);
}

#[tokio::test]
async fn malformed_id_purges_only_opted_in_tables() {
    let (store, gateway, engine) = setup_synced().await;

    // Legacy non-UUID id on the health summary table: evicted.
    store
        .write_local(
            &HEALTH_SUMMARIES,
            fields(json!({"id": "legacy#1", "summary_date": "2025-02-01", "steps": 1000})),
        )
        .unwrap();
    gateway.reject_record(
        "health_summaries",
        "legacy#1",
        GatewayError::MalformedIdentifier("invalid input syntax for type uuid".into()),
    );

    // The same rejection on a meal entry is a plain failure: parked, kept.
    store
        .write_local(
            &MEAL_ENTRIES,
            fields(json!({"id": "m!", "name": "Odd", "calories": 1, "date": "2025-02-01"})),
        )
        .unwrap();
    gateway.reject_record(
        "meal_entries",
        "m!",
        GatewayError::MalformedIdentifier("invalid input syntax for type uuid".into()),
    );

    engine.full_sync().await;

    assert!(store
        .get_by_id(&HEALTH_SUMMARIES, "legacy#1", true)
        .unwrap()
        .is_none());
    assert!(store.get_by_id(&MEAL_ENTRIES, "m!", true).unwrap().is_some());
    let entries = store.due_outbox(FAR_FUTURE).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].table_name, "meal_entries");
}

#[tokio::test]
async fn dead_letter_after_five_attempts() {
    let (store, gateway, engine) = setup_synced().await;

    store
        .write_local(
            &MEAL_ENTRIES,
            fields(json!({"id": "m5", "name": "Doomed", "calories": 5, "date": "2025-02-01"})),
        )
        .unwrap();
    gateway.set_offline(true);

    // First pass parks the row and fails the first replay.
    engine.full_sync().await;
    // Four more failed replays.
    for _ in 0..4 {
        clear_retry_stamps(&store);
        engine.full_sync().await;
    }

    let entries = store.due_outbox(FAR_FUTURE).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].retry_count, 5);

    // Sixth drain: dropped, synced flag untouched, queue shrinks.
    clear_retry_stamps(&store);
    let summary = engine.full_sync().await;
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(store.outbox_len().unwrap(), 0);
    assert_eq!(engine.queue_size(), 0);

    let row = store.get_by_id(&MEAL_ENTRIES, "m5", true).unwrap().unwrap();
    assert!(!row.synced);
    assert_eq!(engine.status().state, SyncState::Error);
    assert!(engine.status().last_error.is_some());
}

// ============================================================================
// Idempotence and round trips
// ============================================================================

#[tokio::test]
async fn double_full_sync_is_idempotent() {
    let (store, gateway, engine) = setup().await;
    gateway.seed_row("meal_entries", remote_meal("m1", 100, "2025-01-01T00:00:00Z"));

    engine.full_sync().await;
    let local_before = store.get_all(&MEAL_ENTRIES, true, Some("id ASC")).unwrap();
    let upserts = gateway.upsert_calls();
    let deletes = gateway.delete_calls();

    let summary = engine.full_sync().await;
    assert!(summary.is_clean());
    assert_eq!(summary.pushed, 0);

    let local_after = store.get_all(&MEAL_ENTRIES, true, Some("id ASC")).unwrap();
    assert_eq!(local_before, local_after);
    assert_eq!(gateway.upsert_calls(), upserts);
    assert_eq!(gateway.delete_calls(), deletes);
    assert_eq!(store.outbox_len().unwrap(), 0);
}

#[tokio::test]
async fn insert_sync_then_pull_only_converges() {
    let (store, gateway, engine) = setup_synced().await;

    store
        .write_local(
            &MEAL_ENTRIES,
            fields(json!({"id": "m4", "name": "Dinner", "calories": 400, "date": "2025-02-02"})),
        )
        .unwrap();
    engine.full_sync().await;
    assert!(gateway.row("meal_entries", "m4").is_some());

    let before = store.get_by_id(&MEAL_ENTRIES, "m4", false).unwrap().unwrap();
    let summary = engine.download().await;
    assert!(summary.is_clean());

    let after = store.get_by_id(&MEAL_ENTRIES, "m4", false).unwrap().unwrap();
    assert!(after.synced);
    assert_eq!(before.fields, after.fields);
}

#[tokio::test]
async fn pull_preserves_pending_delete_and_newer_local_edit() {
    let (store, gateway, engine) = setup_synced().await;
    gateway.seed_row("meal_entries", remote_meal("m1", 100, "2025-01-01T00:00:00Z"));
    gateway.seed_row("meal_entries", remote_meal("m2", 200, "2025-01-01T00:00:00Z"));

    // m1: local tombstone awaiting remote confirmation.
    store
        .upsert_row(&MEAL_ENTRIES, &local_meal("m1", 100, "2025-01-01T00:00:00Z"), true)
        .unwrap();
    store.soft_delete(&MEAL_ENTRIES, "m1").unwrap();
    // m2: local edit strictly newer than the server copy.
    store
        .upsert_row(&MEAL_ENTRIES, &local_meal("m2", 250, "2025-03-01T00:00:00Z"), false)
        .unwrap();

    let summary = engine.download().await;
    assert!(summary.is_clean());

    let m1 = store.get_by_id(&MEAL_ENTRIES, "m1", true).unwrap().unwrap();
    assert!(m1.deleted, "pending delete must survive the pull");
    let m2 = store.get_by_id(&MEAL_ENTRIES, "m2", true).unwrap().unwrap();
    assert_eq!(m2.fields["calories"], json!(250));
    assert!(!m2.synced);
}

#[tokio::test]
async fn pull_sweeps_rows_the_server_dropped() {
    let (store, gateway, engine) = setup().await;
    gateway.seed_row("meal_entries", remote_meal("m1", 100, "2025-01-01T00:00:00Z"));
    engine.full_sync().await;
    assert!(store.get_by_id(&MEAL_ENTRIES, "m1", false).unwrap().is_some());

    // Another device deleted m1; the next pull notices the absence.
    gateway.remove_row("meal_entries", "m1");
    engine.full_sync().await;
    assert!(store.get_by_id(&MEAL_ENTRIES, "m1", true).unwrap().is_none());
}

// ============================================================================
// Push boundaries
// ============================================================================

#[tokio::test]
async fn strictly_newer_server_wins_without_upsert() {
    let (store, gateway, engine) = setup_synced().await;
    gateway.seed_row("meal_entries", remote_meal("m1", 175, "2025-01-10T00:00:00Z"));
    store
        .upsert_row(&MEAL_ENTRIES, &local_meal("m1", 150, "2025-01-05T00:00:00Z"), false)
        .unwrap();

    let upserts = gateway.upsert_calls();
    // Push-only: the full pass would first pull the newer server copy.
    engine.upload().await.unwrap();

    assert_eq!(gateway.upsert_calls(), upserts, "no upsert may be issued");
    let local = store.get_by_id(&MEAL_ENTRIES, "m1", true).unwrap().unwrap();
    assert!(local.synced);
    let remote = gateway.row("meal_entries", "m1").unwrap();
    assert_eq!(remote["calories"], json!(175));
}

#[tokio::test]
async fn equal_timestamps_let_the_client_win() {
    let (store, gateway, engine) = setup_synced().await;
    gateway.seed_row("meal_entries", remote_meal("m1", 175, "2025-01-03T09:00:00Z"));
    store
        .upsert_row(&MEAL_ENTRIES, &local_meal("m1", 150, "2025-01-03T09:00:00Z"), false)
        .unwrap();

    engine.upload().await.unwrap();

    let remote = gateway.row("meal_entries", "m1").unwrap();
    assert_eq!(remote["calories"], json!(150));
    let local = store.get_by_id(&MEAL_ENTRIES, "m1", true).unwrap().unwrap();
    assert!(local.synced);
}

#[tokio::test]
async fn recovered_push_clears_stale_outbox_entry() {
    let (store, gateway, engine) = setup_synced().await;

    store
        .write_local(
            &MEAL_ENTRIES,
            fields(json!({"id": "m6", "name": "Snack", "calories": 60, "date": "2025-02-03"})),
        )
        .unwrap();
    gateway.set_offline(true);
    engine.full_sync().await;
    assert_eq!(engine.queue_size(), 1);

    // Transport recovers; the inline push succeeds and must not leave the
    // parked duplicate behind for the drainer to replay.
    gateway.set_offline(false);
    let summary = engine.full_sync().await;
    assert!(summary.is_clean());
    assert_eq!(store.outbox_len().unwrap(), 0);
    assert_eq!(gateway.row("meal_entries", "m6").unwrap()["calories"], json!(60));
}
