//! Generic per-table CRUD, parameterized by [`TableConfig`].
//!
//! Table and column names are compile-time constants from the config
//! registry, so interpolating them into SQL is safe; all values are bound.

use crate::config::{FieldMap, TableConfig};
use crate::error::{Result, StoreError};
use crate::migrate::LEGACY_MIGRATION_SENTINEL;
use crate::rows::{sql_to_value, value_to_sql, StoredRow};
use crate::time;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashSet;

/// Insert or replace a row, overriding its `synced` flag.
pub(crate) fn upsert(
    conn: &Connection,
    config: &TableConfig,
    row: &StoredRow,
    synced: bool,
) -> Result<()> {
    let cols = config.local_columns();
    let placeholders = vec!["?"; cols.len()].join(", ");
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
        config.local_name,
        cols.join(", "),
        placeholders
    );

    let values: Vec<rusqlite::types::Value> = cols
        .iter()
        .map(|col| match *col {
            "synced" => rusqlite::types::Value::Integer(i64::from(synced)),
            "deleted" => rusqlite::types::Value::Integer(i64::from(row.deleted)),
            name => value_to_sql(row.fields.get(name).unwrap_or(&Value::Null)),
        })
        .collect();

    conn.execute(&sql, params_from_iter(values))
        .map_err(StoreError::write)?;
    Ok(())
}

/// Fetch a row by primary key. Tombstones are filtered out unless
/// `include_deleted` is set.
pub(crate) fn get_by_id(
    conn: &Connection,
    config: &TableConfig,
    id: &str,
    include_deleted: bool,
) -> Result<Option<StoredRow>> {
    let cols = config.local_columns();
    let mut sql = format!(
        "SELECT {} FROM {} WHERE {} = ?",
        cols.join(", "),
        config.local_name,
        config.primary_key
    );
    if config.soft_delete && !include_deleted {
        sql.push_str(" AND deleted = 0");
    }

    conn.query_row(&sql, params![id], |row| read_row(config, row))
        .optional()
        .map_err(StoreError::read)
}

/// All rows with pending local changes, in storage order.
pub(crate) fn get_all_unsynced(conn: &Connection, config: &TableConfig) -> Result<Vec<StoredRow>> {
    let cols = config.local_columns();
    let sql = format!(
        "SELECT {} FROM {} WHERE synced = 0",
        cols.join(", "),
        config.local_name
    );
    collect_rows(conn, config, &sql)
}

/// All rows, optionally including tombstones and ordered by a column
/// expression such as `date DESC`.
pub(crate) fn get_all(
    conn: &Connection,
    config: &TableConfig,
    include_deleted: bool,
    order_by: Option<&str>,
) -> Result<Vec<StoredRow>> {
    let cols = config.local_columns();
    let mut sql = format!("SELECT {} FROM {}", cols.join(", "), config.local_name);
    if config.soft_delete && !include_deleted {
        sql.push_str(" WHERE deleted = 0");
    }
    if let Some(order) = order_by {
        sql.push_str(" ORDER BY ");
        sql.push_str(order);
    }
    collect_rows(conn, config, &sql)
}

pub(crate) fn update_sync_flag(
    conn: &Connection,
    config: &TableConfig,
    id: &str,
    synced: bool,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET synced = ? WHERE {} = ?",
        config.local_name, config.primary_key
    );
    conn.execute(&sql, params![i64::from(synced), id])
        .map_err(StoreError::write)?;
    Ok(())
}

/// Mark a row as a tombstone: `deleted=1, synced=0`, with `updated_at`
/// rewritten to now so the delete carries its own last-write-wins stamp.
pub(crate) fn soft_delete(conn: &Connection, config: &TableConfig, id: &str) -> Result<()> {
    if !config.soft_delete {
        return Err(StoreError::Unsupported {
            table: config.local_name.to_string(),
            reason: "table does not support soft delete".to_string(),
        });
    }
    let sql = format!(
        "UPDATE {} SET deleted = 1, synced = 0, updated_at = ? WHERE {} = ?",
        config.local_name, config.primary_key
    );
    conn.execute(&sql, params![time::now_iso(), id])
        .map_err(StoreError::write)?;
    Ok(())
}

pub(crate) fn hard_delete(conn: &Connection, config: &TableConfig, id: &str) -> Result<bool> {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        config.local_name, config.primary_key
    );
    let affected = conn.execute(&sql, params![id]).map_err(StoreError::write)?;
    Ok(affected > 0)
}

/// Authoritative-delete sweep: remove local rows that are fully synced, not
/// tombstoned, and no longer present on the server. The legacy-migration
/// sentinel never leaves the device this way.
pub(crate) fn delete_missing(
    conn: &Connection,
    config: &TableConfig,
    server_ids: &HashSet<String>,
) -> Result<usize> {
    if config.append_only {
        return Ok(0);
    }
    let mut sql = format!(
        "SELECT {} FROM {} WHERE synced = 1",
        config.primary_key, config.local_name
    );
    if config.soft_delete {
        sql.push_str(" AND deleted = 0");
    }

    let mut stmt = conn.prepare(&sql).map_err(StoreError::read)?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(StoreError::read)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::read)?;

    let mut removed = 0;
    for id in ids {
        if id == LEGACY_MIGRATION_SENTINEL || server_ids.contains(&id) {
            continue;
        }
        if hard_delete(conn, config, &id)? {
            removed += 1;
        }
    }
    Ok(removed)
}

pub(crate) fn count(conn: &Connection, config: &TableConfig) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", config.local_name);
    conn.query_row(&sql, [], |row| row.get(0))
        .map_err(StoreError::read)
}

fn collect_rows(conn: &Connection, config: &TableConfig, sql: &str) -> Result<Vec<StoredRow>> {
    let mut stmt = conn.prepare(sql).map_err(StoreError::read)?;
    let rows = stmt
        .query_map([], |row| read_row(config, row))
        .map_err(StoreError::read)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::read)?;
    Ok(rows)
}

fn read_row(config: &TableConfig, row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    let mut fields = FieldMap::new();
    for (idx, col) in config.columns.iter().enumerate() {
        fields.insert((*col).to_string(), sql_to_value(row.get_ref(idx)?));
    }
    let synced: i64 = row.get(config.columns.len())?;
    let deleted = if config.soft_delete {
        row.get::<_, i64>(config.columns.len() + 1)? != 0
    } else {
        false
    };
    Ok(StoredRow {
        fields,
        synced: synced != 0,
        deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MEAL_ENTRIES, WORKOUT_EVENTS, WORKOUT_SESSIONS};
    use crate::schema::create_schema;
    use serde_json::json;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        conn
    }

    fn meal(id: &str, calories: i64, updated_at: &str) -> StoredRow {
        let Value::Object(fields) = json!({
            "id": id,
            "name": "oats",
            "calories": calories,
            "date": "2025-02-01",
            "updated_at": updated_at,
        }) else {
            unreachable!()
        };
        StoredRow::new(fields)
    }

    #[test]
    fn upsert_then_get_roundtrip() {
        let conn = test_conn();
        let row = meal("m1", 100, "2025-01-01T00:00:00Z");
        upsert(&conn, &MEAL_ENTRIES, &row, false).unwrap();

        let loaded = get_by_id(&conn, &MEAL_ENTRIES, "m1", false)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.fields["calories"], json!(100));
        assert_eq!(loaded.fields["name"], json!("oats"));
        assert!(!loaded.synced);
        assert!(!loaded.deleted);
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let conn = test_conn();
        upsert(
            &conn,
            &MEAL_ENTRIES,
            &meal("m1", 100, "2025-01-01T00:00:00Z"),
            false,
        )
        .unwrap();
        upsert(
            &conn,
            &MEAL_ENTRIES,
            &meal("m1", 250, "2025-01-02T00:00:00Z"),
            true,
        )
        .unwrap();

        let loaded = get_by_id(&conn, &MEAL_ENTRIES, "m1", false)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.fields["calories"], json!(250));
        assert!(loaded.synced);
        assert_eq!(count(&conn, &MEAL_ENTRIES).unwrap(), 1);
    }

    #[test]
    fn unsynced_query_excludes_synced_rows() {
        let conn = test_conn();
        upsert(
            &conn,
            &MEAL_ENTRIES,
            &meal("m1", 100, "2025-01-01T00:00:00Z"),
            true,
        )
        .unwrap();
        upsert(
            &conn,
            &MEAL_ENTRIES,
            &meal("m2", 200, "2025-01-02T00:00:00Z"),
            false,
        )
        .unwrap();

        let unsynced = get_all_unsynced(&conn, &MEAL_ENTRIES).unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].key(&MEAL_ENTRIES), "m2");
    }

    #[test]
    fn soft_delete_stamps_tombstone() {
        let conn = test_conn();
        upsert(
            &conn,
            &MEAL_ENTRIES,
            &meal("m1", 100, "2025-01-01T00:00:00Z"),
            true,
        )
        .unwrap();
        soft_delete(&conn, &MEAL_ENTRIES, "m1").unwrap();

        assert!(get_by_id(&conn, &MEAL_ENTRIES, "m1", false)
            .unwrap()
            .is_none());
        let tombstone = get_by_id(&conn, &MEAL_ENTRIES, "m1", true)
            .unwrap()
            .unwrap();
        assert!(tombstone.deleted);
        assert!(!tombstone.synced);
        // The delete rewrote updated_at to now.
        assert!(tombstone.updated_at() > "2025-01-01T00:00:00Z");
    }

    #[test]
    fn soft_delete_rejected_on_append_only_table() {
        let conn = test_conn();
        let err = soft_delete(&conn, &WORKOUT_EVENTS, "e1").unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_OP");
    }

    #[test]
    fn get_all_orders_and_filters() {
        let conn = test_conn();
        upsert(
            &conn,
            &MEAL_ENTRIES,
            &meal("m1", 100, "2025-01-01T00:00:00Z"),
            true,
        )
        .unwrap();
        upsert(
            &conn,
            &MEAL_ENTRIES,
            &meal("m2", 200, "2025-01-02T00:00:00Z"),
            true,
        )
        .unwrap();
        soft_delete(&conn, &MEAL_ENTRIES, "m1").unwrap();

        let visible = get_all(&conn, &MEAL_ENTRIES, false, Some("date DESC")).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].key(&MEAL_ENTRIES), "m2");

        let all = get_all(&conn, &MEAL_ENTRIES, true, None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn delete_missing_sweeps_only_synced_live_rows() {
        let conn = test_conn();
        // Synced and gone from the server: swept.
        upsert(
            &conn,
            &MEAL_ENTRIES,
            &meal("gone", 1, "2025-01-01T00:00:00Z"),
            true,
        )
        .unwrap();
        // Still on the server: kept.
        upsert(
            &conn,
            &MEAL_ENTRIES,
            &meal("kept", 2, "2025-01-01T00:00:00Z"),
            true,
        )
        .unwrap();
        // Unsynced local edit: never swept.
        upsert(
            &conn,
            &MEAL_ENTRIES,
            &meal("local", 3, "2025-01-01T00:00:00Z"),
            false,
        )
        .unwrap();

        let server_ids: HashSet<String> = ["kept".to_string()].into();
        let removed = delete_missing(&conn, &MEAL_ENTRIES, &server_ids).unwrap();
        assert_eq!(removed, 1);
        assert!(get_by_id(&conn, &MEAL_ENTRIES, "gone", true)
            .unwrap()
            .is_none());
        assert!(get_by_id(&conn, &MEAL_ENTRIES, "local", true)
            .unwrap()
            .is_some());
    }

    #[test]
    fn delete_missing_skips_append_only_and_sentinel() {
        let conn = test_conn();
        let Value::Object(fields) = json!({
            "id": LEGACY_MIGRATION_SENTINEL,
            "updated_at": "2025-01-01T00:00:00Z",
        }) else {
            unreachable!()
        };
        upsert(&conn, &WORKOUT_SESSIONS, &StoredRow::new(fields), true).unwrap();

        let removed = delete_missing(&conn, &WORKOUT_SESSIONS, &HashSet::new()).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(
            delete_missing(&conn, &WORKOUT_EVENTS, &HashSet::new()).unwrap(),
            0
        );
    }
}
