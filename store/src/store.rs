//! The embedded store: one SQLite file, one logical writer, no network.

use crate::config::{replicated_tables, FieldMap, TableConfig, EXERCISES};
use crate::error::{Result, StoreError};
use crate::migrate::{self, LEGACY_MIGRATION_SENTINEL};
use crate::outbox::{self, OutboxEntry, OutboxOp};
use crate::rows::StoredRow;
use crate::time;
use crate::{schema, seed, tables};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

/// Back-off schedule for [`LocalStore::ensure_initialized`], in milliseconds.
const INIT_RETRY_SCHEDULE_MS: [u64; 3] = [100, 300, 900];

/// Handle to the on-device database.
///
/// Constructed once at startup and passed down by value reference; all
/// writes serialize through the internal connection mutex. Every single-row
/// mutation is atomic and crash-safe; there are no cross-table transactions.
pub struct LocalStore {
    conn: Mutex<Connection>,
    init_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
}

impl LocalStore {
    /// Open (or create) the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(StoreError::init)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory database. Used by tests and previews.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::init)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            init_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Direct access to the underlying connection. Escape hatch for app-level
    /// migrations and test fixtures; replication code goes through the typed
    /// surface below.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Idempotent initialization: create missing tables and indexes, apply
    /// control-table evolutions, seed the catalogue on first run, then run
    /// the one-shot legacy migration. Concurrent callers join the same
    /// in-flight run.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let now = time::now_iso();
        {
            let conn = self.conn();
            schema::create_schema(&conn)?;

            if tables::count(&conn, &EXERCISES)? == 0 {
                let seeded = seed::seed_catalogue(&conn, &now)?;
                info!(seeded, "seeded system exercise catalogue");
            }

            let migrated = migrate::run_legacy_migration(&conn, &now)?;
            if migrated > 0 {
                info!(migrated, "migrated legacy workout rows");
            }
        }

        self.initialized.store(true, Ordering::Release);
        info!("local store initialized");
        Ok(())
    }

    /// [`initialize`](Self::initialize) with up to three retries on an
    /// increasing back-off. Returns the final `DB_INIT_FAILED` error instead
    /// of panicking when all attempts are exhausted.
    pub async fn ensure_initialized(&self) -> Result<()> {
        let mut last_err = match self.initialize().await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        for delay_ms in INIT_RETRY_SCHEDULE_MS {
            warn!(error = %last_err, delay_ms, "store initialization failed, retrying");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            match self.initialize().await {
                Ok(()) => return Ok(()),
                Err(err) => last_err = err,
            }
        }

        Err(StoreError::InitFailed(format!(
            "initialization failed after {} attempts: {last_err}",
            INIT_RETRY_SCHEDULE_MS.len() + 1
        )))
    }

    // ------------------------------------------------------------------
    // Record table surface
    // ------------------------------------------------------------------

    /// Insert or replace a row with an explicit `synced` flag.
    pub fn upsert_row(&self, config: &TableConfig, row: &StoredRow, synced: bool) -> Result<()> {
        tables::upsert(&self.conn(), config, row, synced)
    }

    /// Record a local application write: stamps `updated_at` to now and
    /// stores the row `synced=0`, making it eligible for the next push.
    pub fn write_local(&self, config: &TableConfig, mut fields: FieldMap) -> Result<StoredRow> {
        fields.insert(
            "updated_at".into(),
            serde_json::Value::String(time::now_iso()),
        );
        let row = StoredRow::new(fields);
        tables::upsert(&self.conn(), config, &row, false)?;
        Ok(row)
    }

    pub fn get_by_id(
        &self,
        config: &TableConfig,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<StoredRow>> {
        tables::get_by_id(&self.conn(), config, id, include_deleted)
    }

    pub fn get_all_unsynced(&self, config: &TableConfig) -> Result<Vec<StoredRow>> {
        tables::get_all_unsynced(&self.conn(), config)
    }

    pub fn get_all(
        &self,
        config: &TableConfig,
        include_deleted: bool,
        order_by: Option<&str>,
    ) -> Result<Vec<StoredRow>> {
        tables::get_all(&self.conn(), config, include_deleted, order_by)
    }

    pub fn update_sync_flag(&self, config: &TableConfig, id: &str, synced: bool) -> Result<()> {
        tables::update_sync_flag(&self.conn(), config, id, synced)
    }

    pub fn soft_delete(&self, config: &TableConfig, id: &str) -> Result<()> {
        tables::soft_delete(&self.conn(), config, id)
    }

    pub fn hard_delete(&self, config: &TableConfig, id: &str) -> Result<bool> {
        tables::hard_delete(&self.conn(), config, id)
    }

    pub fn delete_missing(
        &self,
        config: &TableConfig,
        server_ids: &HashSet<String>,
    ) -> Result<usize> {
        tables::delete_missing(&self.conn(), config, server_ids)
    }

    pub fn count(&self, config: &TableConfig) -> Result<i64> {
        tables::count(&self.conn(), config)
    }

    /// Hard-delete every confirmed tombstone (`deleted=1 AND synced=1`)
    /// across all soft-delete tables. Runs at the tail of every sync pass.
    pub fn cleanup_deleted(&self) -> Result<usize> {
        let conn = self.conn();
        let mut removed = 0;
        for config in replicated_tables() {
            if !config.soft_delete {
                continue;
            }
            let sql = format!(
                "DELETE FROM {} WHERE deleted = 1 AND synced = 1",
                config.local_name
            );
            removed += conn.execute(&sql, []).map_err(StoreError::write)?;
        }
        Ok(removed)
    }

    /// Clear all user data on logout: every record table except the shared
    /// catalogue, plus the outbox. The migration sentinel stays so the legacy
    /// migration does not re-run for the next account.
    pub fn wipe_user_data(&self) -> Result<()> {
        let conn = self.conn();
        for config in replicated_tables() {
            if config.local_name == EXERCISES.local_name {
                continue;
            }
            let sql = format!(
                "DELETE FROM {} WHERE {} != ?",
                config.local_name, config.primary_key
            );
            conn.execute(&sql, rusqlite::params![LEGACY_MIGRATION_SENTINEL])
                .map_err(StoreError::write)?;
        }
        conn.execute("DELETE FROM sync_outbox", [])
            .map_err(StoreError::write)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbox surface
    // ------------------------------------------------------------------

    pub fn enqueue_outbox(
        &self,
        table_name: &str,
        op: OutboxOp,
        record_id: &str,
        payload: Option<&str>,
    ) -> Result<i64> {
        outbox::enqueue(
            &self.conn(),
            table_name,
            op,
            record_id,
            payload,
            &time::now_iso(),
        )
    }

    /// Outbox entries that are ready for replay, in drain order.
    pub fn due_outbox(&self, now: &str) -> Result<Vec<OutboxEntry>> {
        outbox::due_entries(&self.conn(), now)
    }

    pub fn outbox_len(&self) -> Result<usize> {
        outbox::len(&self.conn())
    }

    pub fn remove_outbox(&self, id: i64) -> Result<()> {
        outbox::remove(&self.conn(), id)
    }

    pub fn remove_outbox_for_record(&self, table_name: &str, record_id: &str) -> Result<()> {
        outbox::remove_for_record(&self.conn(), table_name, record_id)
    }

    pub fn increment_outbox_retry(&self, id: i64, next_retry_at: &str) -> Result<()> {
        outbox::increment_retry(&self.conn(), id, next_retry_at)
    }
}
