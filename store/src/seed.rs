//! System exercise catalogue seeded on first launch.
//!
//! Seed rows are inserted `synced=0` so a fresh install replicates them
//! upward (or reconciles them against a server-provided catalogue). Their ids
//! carry a stable prefix marking them as system-originated.

use crate::config::{FieldMap, EXERCISES};
use crate::error::Result;
use crate::rows::StoredRow;
use crate::tables;
use rusqlite::Connection;
use serde_json::Value;

/// Id prefix of system-originated catalogue rows.
pub const SYSTEM_ID_PREFIX: &str = "system-";

/// (id suffix, name, category, muscle group, equipment)
const SYSTEM_EXERCISES: &[(&str, &str, &str, &str, &str)] = &[
    ("bench-press", "Bench Press", "strength", "chest", "barbell"),
    ("squat", "Squat", "strength", "legs", "barbell"),
    ("deadlift", "Deadlift", "strength", "back", "barbell"),
    ("overhead-press", "Overhead Press", "strength", "shoulders", "barbell"),
    ("barbell-row", "Barbell Row", "strength", "back", "barbell"),
    ("pull-up", "Pull-Up", "strength", "back", "bodyweight"),
    ("push-up", "Push-Up", "strength", "chest", "bodyweight"),
    ("dumbbell-curl", "Dumbbell Curl", "strength", "arms", "dumbbell"),
    ("tricep-extension", "Tricep Extension", "strength", "arms", "dumbbell"),
    ("lunge", "Lunge", "strength", "legs", "bodyweight"),
    ("plank", "Plank", "core", "abs", "bodyweight"),
    ("running", "Running", "cardio", "legs", "none"),
    ("cycling", "Cycling", "cardio", "legs", "machine"),
    ("rowing", "Rowing", "cardio", "back", "machine"),
];

/// Insert the system catalogue. Callers are expected to have checked that
/// the catalogue is empty; rows are upserts, so a re-run is harmless.
pub(crate) fn seed_catalogue(conn: &Connection, now: &str) -> Result<usize> {
    for (slug, name, category, muscle_group, equipment) in SYSTEM_EXERCISES {
        let mut fields = FieldMap::new();
        fields.insert("id".into(), Value::String(format!("{SYSTEM_ID_PREFIX}{slug}")));
        fields.insert("name".into(), Value::String((*name).to_string()));
        fields.insert("category".into(), Value::String((*category).to_string()));
        fields.insert(
            "muscle_group".into(),
            Value::String((*muscle_group).to_string()),
        );
        fields.insert("equipment".into(), Value::String((*equipment).to_string()));
        fields.insert("is_system".into(), Value::from(1));
        fields.insert("created_at".into(), Value::String(now.to_string()));
        fields.insert("updated_at".into(), Value::String(now.to_string()));

        tables::upsert(conn, &EXERCISES, &StoredRow::new(fields), false)?;
    }
    Ok(SYSTEM_EXERCISES.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::create_schema;

    #[test]
    fn seeds_are_unsynced_system_rows() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();

        let seeded = seed_catalogue(&conn, "2025-01-01T00:00:00Z").unwrap();
        assert_eq!(seeded as i64, tables::count(&conn, &EXERCISES).unwrap());

        let rows = tables::get_all(&conn, &EXERCISES, false, Some("name ASC")).unwrap();
        for row in &rows {
            assert!(!row.synced);
            assert!(row.key(&EXERCISES).starts_with(SYSTEM_ID_PREFIX));
            assert_eq!(row.fields["is_system"], serde_json::json!(1));
        }
    }

    #[test]
    fn reseeding_does_not_duplicate() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        seed_catalogue(&conn, "2025-01-01T00:00:00Z").unwrap();
        seed_catalogue(&conn, "2025-01-02T00:00:00Z").unwrap();
        assert_eq!(
            tables::count(&conn, &EXERCISES).unwrap(),
            SYSTEM_EXERCISES.len() as i64
        );
    }
}
