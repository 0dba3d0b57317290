//! Local schema: table DDL, indexes, and best-effort column evolution.

use crate::error::{Result, StoreError};
use rusqlite::Connection;
use tracing::warn;

/// Record tables. Every replicated table carries `id`, `updated_at` and
/// `synced`; soft-delete tables additionally carry `deleted`.
const TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS exercises (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        category TEXT,
        muscle_group TEXT,
        equipment TEXT,
        is_system INTEGER NOT NULL DEFAULT 0,
        created_at TEXT,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS meal_entries (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        calories REAL,
        protein REAL,
        carbs REAL,
        fat REAL,
        date TEXT NOT NULL,
        logged_at TEXT,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS exercise_entries (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        duration_minutes REAL,
        calories_burned REAL,
        date TEXT NOT NULL,
        logged_at TEXT,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS health_summaries (
        id TEXT PRIMARY KEY,
        summary_date TEXT NOT NULL,
        steps INTEGER,
        active_calories REAL,
        resting_heart_rate REAL,
        sleep_hours REAL,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS nutrition_targets (
        id TEXT PRIMARY KEY,
        calories REAL,
        protein REAL,
        carbs REAL,
        fat REAL,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS workout_events (
        id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        payload TEXT,
        occurred_at TEXT,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS workout_sessions (
        id TEXT PRIMARY KEY,
        name TEXT,
        started_at TEXT,
        completed_at TEXT,
        notes TEXT,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS session_exercises (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        exercise_id TEXT,
        sort_order INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS session_sets (
        id TEXT PRIMARY KEY,
        session_exercise_id TEXT NOT NULL,
        set_number INTEGER NOT NULL DEFAULT 1,
        weight_kg REAL,
        reps INTEGER,
        completed INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS workout_templates (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        created_at TEXT,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS template_exercises (
        id TEXT PRIMARY KEY,
        template_id TEXT NOT NULL,
        exercise_id TEXT,
        sort_order INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS template_sets (
        id TEXT PRIMARY KEY,
        template_exercise_id TEXT NOT NULL,
        set_number INTEGER NOT NULL DEFAULT 1,
        target_weight_kg REAL,
        target_reps INTEGER,
        updated_at TEXT NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS sync_outbox (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        op TEXT NOT NULL,
        record_id TEXT NOT NULL,
        payload TEXT,
        created_at TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        next_retry_at TEXT
    )",
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_meal_entries_date ON meal_entries (date DESC)",
    "CREATE INDEX IF NOT EXISTS idx_meal_entries_synced ON meal_entries (synced)",
    "CREATE INDEX IF NOT EXISTS idx_exercise_entries_date ON exercise_entries (date DESC)",
    "CREATE INDEX IF NOT EXISTS idx_exercise_entries_synced ON exercise_entries (synced)",
    "CREATE INDEX IF NOT EXISTS idx_health_summaries_date ON health_summaries (summary_date DESC)",
    "CREATE INDEX IF NOT EXISTS idx_health_summaries_synced ON health_summaries (synced)",
    "CREATE INDEX IF NOT EXISTS idx_workout_events_synced ON workout_events (synced)",
    "CREATE INDEX IF NOT EXISTS idx_workout_sessions_started ON workout_sessions (started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_workout_sessions_synced ON workout_sessions (synced)",
    "CREATE INDEX IF NOT EXISTS idx_session_exercises_session
        ON session_exercises (session_id, sort_order)",
    "CREATE INDEX IF NOT EXISTS idx_session_sets_exercise
        ON session_sets (session_exercise_id, set_number)",
    "CREATE INDEX IF NOT EXISTS idx_template_exercises_template
        ON template_exercises (template_id, sort_order)",
    "CREATE INDEX IF NOT EXISTS idx_template_sets_exercise
        ON template_sets (template_exercise_id, set_number)",
    "CREATE INDEX IF NOT EXISTS idx_sync_outbox_retry ON sync_outbox (next_retry_at, created_at)",
];

/// Column additions applied to control tables of older installs. The outbox
/// predates its back-off columns.
const CONTROL_TABLE_EVOLUTIONS: &[(&str, &str)] = &[
    ("sync_outbox", "retry_count INTEGER NOT NULL DEFAULT 0"),
    ("sync_outbox", "next_retry_at TEXT"),
];

/// Create all tables and indexes, then apply best-effort column evolutions.
pub(crate) fn create_schema(conn: &Connection) -> Result<()> {
    for ddl in TABLES {
        conn.execute(ddl, []).map_err(StoreError::init)?;
    }
    for ddl in INDEXES {
        conn.execute(ddl, []).map_err(StoreError::init)?;
    }
    for (table, column) in CONTROL_TABLE_EVOLUTIONS {
        add_column_if_missing(conn, table, column);
    }
    Ok(())
}

/// Best-effort `ALTER TABLE ADD COLUMN`. The duplicate-column case is
/// swallowed silently; any other failure is logged and does not fail
/// initialization.
pub(crate) fn add_column_if_missing(conn: &Connection, table: &str, column_def: &str) {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column_def}");
    if let Err(err) = conn.execute(&sql, []) {
        let message = err.to_string();
        if !message.contains("duplicate column name") {
            warn!(table, column_def, error = %message, "schema evolution failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn schema_creation_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        create_schema(&conn).unwrap();

        let cols = column_names(&conn, "meal_entries");
        assert!(cols.contains(&"synced".to_string()));
        assert!(cols.contains(&"deleted".to_string()));
    }

    #[test]
    fn schema_covers_every_configured_table() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();

        for cfg in crate::config::replicated_tables() {
            let cols = column_names(&conn, cfg.local_name);
            for expected in cfg.local_columns() {
                assert!(
                    cols.contains(&expected.to_string()),
                    "{} missing column {}",
                    cfg.local_name,
                    expected
                );
            }
        }
    }

    #[test]
    fn outbox_backoff_columns_are_added_to_old_installs() {
        let conn = Connection::open_in_memory().unwrap();
        // Outbox shape from before the back-off columns existed.
        conn.execute(
            "CREATE TABLE sync_outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                op TEXT NOT NULL,
                record_id TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .unwrap();

        create_schema(&conn).unwrap();

        let cols = column_names(&conn, "sync_outbox");
        assert!(cols.contains(&"retry_count".to_string()));
        assert!(cols.contains(&"next_retry_at".to_string()));
    }

    #[test]
    fn add_column_swallows_duplicates() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        // Applying the same evolution twice must not error.
        add_column_if_missing(&conn, "sync_outbox", "next_retry_at TEXT");
        add_column_if_missing(&conn, "sync_outbox", "next_retry_at TEXT");
    }
}
