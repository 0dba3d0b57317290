//! In-memory [`RemoteGateway`] for tests and previews.
//!
//! Faithful to the contract the engine relies on: user-scoped range reads,
//! point reads that report absence as `None`, per-record rejections with the
//! classified error codes, a global offline switch that turns every call
//! into a transport failure, and manual change-feed emission.

use crate::gateway::{ChangeEvent, GatewayError, RemoteGateway};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tempo_store::FieldMap;
use tokio::sync::mpsc;

type Tables = HashMap<String, BTreeMap<String, FieldMap>>;

/// A fake hosted backend held entirely in memory.
#[derive(Default)]
pub struct InMemoryGateway {
    tables: Mutex<Tables>,
    rejections: Mutex<HashMap<(String, String), GatewayError>>,
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<ChangeEvent>>>>,
    offline: AtomicBool,
    upsert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    point_reads: AtomicUsize,
    range_reads: AtomicUsize,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a row on the "server" without going through the sync protocol.
    pub fn seed_row(&self, table: &str, fields: FieldMap) {
        let id = row_id(&fields).unwrap_or_default();
        self.lock_tables()
            .entry(table.to_string())
            .or_default()
            .insert(id, fields);
    }

    /// Current server copy of a row.
    pub fn row(&self, table: &str, id: &str) -> Option<FieldMap> {
        self.lock_tables()
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// All server rows of a table, in id order.
    pub fn table_rows(&self, table: &str) -> Vec<FieldMap> {
        self.lock_tables()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove_row(&self, table: &str, id: &str) {
        if let Some(rows) = self.lock_tables().get_mut(table) {
            rows.remove(id);
        }
    }

    /// When offline, every gateway call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make upserts and deletes of one record fail with the given error.
    pub fn reject_record(&self, table: &str, id: &str, error: GatewayError) {
        self.lock_rejections()
            .insert((table.to_string(), id.to_string()), error);
    }

    /// Deliver a delta on a table's change feed.
    pub async fn emit(&self, table: &str, event: ChangeEvent) {
        let senders: Vec<mpsc::Sender<ChangeEvent>> = self
            .lock_channels()
            .get(table)
            .map(|subs| subs.to_vec())
            .unwrap_or_default();
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn point_reads(&self) -> usize {
        self.point_reads.load(Ordering::SeqCst)
    }

    pub fn range_reads(&self) -> usize {
        self.range_reads.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), GatewayError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(GatewayError::Transport("network unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn rejection_for(&self, table: &str, id: &str) -> Option<GatewayError> {
        self.lock_rejections()
            .get(&(table.to_string(), id.to_string()))
            .cloned()
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_rejections(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String), GatewayError>> {
        match self.rejections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_channels(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Vec<mpsc::Sender<ChangeEvent>>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn row_id(fields: &FieldMap) -> Option<String> {
    match fields.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) if !other.is_null() => Some(other.to_string()),
        _ => None,
    }
}

#[async_trait]
impl RemoteGateway for InMemoryGateway {
    async fn upsert(
        &self,
        table: &str,
        rows: Vec<FieldMap>,
        on_conflict: Option<&str>,
    ) -> Result<(), GatewayError> {
        self.check_online()?;
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);

        for fields in rows {
            let Some(id) = row_id(&fields) else {
                return Err(GatewayError::MalformedIdentifier("missing id".into()));
            };
            if let Some(err) = self.rejection_for(table, &id) {
                return Err(err);
            }

            let mut tables = self.lock_tables();
            let table_rows = tables.entry(table.to_string()).or_default();

            // Honor the declared uniqueness key: an upsert matching an
            // existing row on every key column replaces that row.
            if let Some(key) = on_conflict {
                let key_cols: Vec<&str> = key.split(',').map(str::trim).collect();
                let existing = table_rows
                    .iter()
                    .find(|(_, row)| {
                        key_cols
                            .iter()
                            .all(|col| row.get(*col) == fields.get(*col))
                    })
                    .map(|(existing_id, _)| existing_id.clone());
                if let Some(existing_id) = existing {
                    table_rows.remove(&existing_id);
                }
            }

            table_rows.insert(id, fields);
        }
        Ok(())
    }

    async fn delete(&self, table: &str, _primary_key: &str, id: &str) -> Result<(), GatewayError> {
        self.check_online()?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.rejection_for(table, id) {
            return Err(err);
        }
        if let Some(rows) = self.lock_tables().get_mut(table) {
            rows.remove(id);
        }
        Ok(())
    }

    async fn fetch_updated_at(
        &self,
        table: &str,
        _primary_key: &str,
        id: &str,
    ) -> Result<Option<String>, GatewayError> {
        self.check_online()?;
        self.point_reads.fetch_add(1, Ordering::SeqCst);

        Ok(self
            .lock_tables()
            .get(table)
            .and_then(|rows| rows.get(id))
            .and_then(|row| row.get("updated_at"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn fetch_rows(
        &self,
        table: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<FieldMap>, GatewayError> {
        self.check_online()?;
        self.range_reads.fetch_add(1, Ordering::SeqCst);

        let rows = self
            .lock_tables()
            .get(table)
            .map(|rows| rows.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        Ok(match user_id {
            Some(user) => rows
                .into_iter()
                .filter(|row| row.get("user_id").and_then(Value::as_str) == Some(user))
                .collect(),
            None => rows,
        })
    }

    async fn subscribe(
        &self,
        table: &str,
        _user_id: Option<&str>,
    ) -> Result<mpsc::Receiver<ChangeEvent>, GatewayError> {
        let (tx, rx) = mpsc::channel(64);
        self.lock_channels()
            .entry(table.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
