//! One-shot migration of the pre-rewrite flat workout table.
//!
//! Older installs logged workouts as single flat rows. Each legacy row
//! becomes a (session, session-exercise, session-set) triple, preserving the
//! legacy id as the session id so references stay addressable. A sentinel row
//! in `workout_sessions` records that the migration has run; it is written
//! `synced=1` and skipped by the server-delete sweep, so it never replicates
//! and never triggers a re-run.

use crate::config::{FieldMap, SESSION_EXERCISES, SESSION_SETS, WORKOUT_SESSIONS};
use crate::error::{Result, StoreError};
use crate::rows::StoredRow;
use crate::tables;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Fixed id of the migration sentinel row in `workout_sessions`.
pub const LEGACY_MIGRATION_SENTINEL: &str = "legacy-migration-marker";

struct LegacyWorkout {
    id: String,
    exercise: String,
    weight: Option<f64>,
    reps: Option<i64>,
    sets: i64,
    date: Option<String>,
}

/// Run the migration if it has not run yet. Returns the number of legacy
/// rows translated.
pub(crate) fn run_legacy_migration(conn: &Connection, now: &str) -> Result<usize> {
    if sentinel_present(conn)? {
        return Ok(0);
    }

    let migrated = if legacy_table_exists(conn)? {
        migrate_rows(conn, now)?
    } else {
        0
    };

    write_sentinel(conn, now)?;
    Ok(migrated)
}

fn sentinel_present(conn: &Connection) -> Result<bool> {
    Ok(
        tables::get_by_id(conn, &WORKOUT_SESSIONS, LEGACY_MIGRATION_SENTINEL, true)?.is_some(),
    )
}

fn legacy_table_exists(conn: &Connection) -> Result<bool> {
    let name: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'legacy_workouts'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::read)?;
    Ok(name.is_some())
}

fn migrate_rows(conn: &Connection, now: &str) -> Result<usize> {
    let mut stmt = conn
        .prepare("SELECT id, exercise, weight, reps, sets, date FROM legacy_workouts")
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
    let legacy = stmt
        .query_map([], |row| {
            Ok(LegacyWorkout {
                id: row.get(0)?,
                exercise: row.get(1)?,
                weight: row.get(2)?,
                reps: row.get(3)?,
                sets: row.get::<_, Option<i64>>(4)?.unwrap_or(1).max(1),
                date: row.get(5)?,
            })
        })
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    let mut migrated = 0;
    for workout in legacy {
        let Some(exercise_id) = find_exercise_id(conn, &workout.exercise)? else {
            debug!(
                legacy_id = %workout.id,
                exercise = %workout.exercise,
                "skipping legacy workout with unknown exercise"
            );
            continue;
        };

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
        insert_triple(&tx, &workout, &exercise_id, now)?;
        tx.commit()
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
        migrated += 1;
    }
    Ok(migrated)
}

fn find_exercise_id(conn: &Connection, name: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM exercises WHERE LOWER(name) = LOWER(?)",
        params![name],
        |row| row.get(0),
    )
    .optional()
    .map_err(StoreError::read)
}

fn insert_triple(
    conn: &Connection,
    workout: &LegacyWorkout,
    exercise_id: &str,
    now: &str,
) -> Result<()> {
    let mut session = FieldMap::new();
    session.insert("id".into(), Value::String(workout.id.clone()));
    session.insert("name".into(), Value::String(workout.exercise.clone()));
    session.insert(
        "started_at".into(),
        workout.date.clone().map(Value::String).unwrap_or(Value::Null),
    );
    session.insert(
        "completed_at".into(),
        workout.date.clone().map(Value::String).unwrap_or(Value::Null),
    );
    session.insert("updated_at".into(), Value::String(now.to_string()));
    tables::upsert(conn, &WORKOUT_SESSIONS, &StoredRow::new(session), false)?;

    let session_exercise_id = Uuid::new_v4().to_string();
    let mut session_exercise = FieldMap::new();
    session_exercise.insert("id".into(), Value::String(session_exercise_id.clone()));
    session_exercise.insert("session_id".into(), Value::String(workout.id.clone()));
    session_exercise.insert("exercise_id".into(), Value::String(exercise_id.to_string()));
    session_exercise.insert("sort_order".into(), Value::from(0));
    session_exercise.insert("updated_at".into(), Value::String(now.to_string()));
    tables::upsert(
        conn,
        &SESSION_EXERCISES,
        &StoredRow::new(session_exercise),
        false,
    )?;

    for set_number in 1..=workout.sets {
        let mut set = FieldMap::new();
        set.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        set.insert(
            "session_exercise_id".into(),
            Value::String(session_exercise_id.clone()),
        );
        set.insert("set_number".into(), Value::from(set_number));
        set.insert(
            "weight_kg".into(),
            workout.weight.map(Value::from).unwrap_or(Value::Null),
        );
        set.insert(
            "reps".into(),
            workout.reps.map(Value::from).unwrap_or(Value::Null),
        );
        set.insert("completed".into(), Value::from(1));
        set.insert("updated_at".into(), Value::String(now.to_string()));
        tables::upsert(conn, &SESSION_SETS, &StoredRow::new(set), false)?;
    }

    Ok(())
}

fn write_sentinel(conn: &Connection, now: &str) -> Result<()> {
    let mut fields = FieldMap::new();
    fields.insert("id".into(), Value::String(LEGACY_MIGRATION_SENTINEL.into()));
    fields.insert("updated_at".into(), Value::String(now.to_string()));
    tables::upsert(conn, &WORKOUT_SESSIONS, &StoredRow::new(fields), true)
}
