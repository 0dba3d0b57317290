//! # Tempo Store
//!
//! The embedded, offline-first store for Tempo. Every read and write in the
//! app touches this crate first; replication to the hosted backend is layered
//! on top by `tempo-sync` and never blocks local access.
//!
//! ## Design principles
//!
//! - **No network**: the store knows nothing about transports or servers
//! - **One writer**: a single logical SQLite connection, serialized internally
//! - **Config-driven**: every replicated table is described by a
//!   [`TableConfig`]; new tables join by adding data, not code paths
//! - **Durable intermediate state**: sync flags, tombstones and the retry
//!   outbox are all persisted before the next step runs
//!
//! ## Core concepts
//!
//! ### Rows
//!
//! A [`StoredRow`] is a JSON field map (the replicated projection) plus two
//! local control flags: `synced` (0 while the row has uncommitted local
//! changes) and, on soft-delete tables, `deleted` (a tombstone awaiting
//! remote confirmation). `updated_at` is an ISO-8601 UTC string rewritten on
//! every local mutation; it is the last-write-wins scalar.
//!
//! ### Outbox
//!
//! Remote operations that fail inline are parked in [`OutboxEntry`] rows and
//! replayed later with exponential back-off. The payload stays an opaque JSON
//! string until drain time.
//!
//! ### Initialization
//!
//! [`LocalStore::initialize`] is idempotent and single-flight: it creates the
//! schema, applies best-effort column evolutions, seeds the exercise
//! catalogue on first run, and performs the one-shot legacy workout
//! migration. [`LocalStore::ensure_initialized`] retries on a short back-off
//! and reports a coded failure instead of panicking.
//!
//! ## Quick start
//!
//! ```rust
//! use tempo_store::{LocalStore, MEAL_ENTRIES};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tempo_store::Result<()> {
//! let store = LocalStore::open_in_memory()?;
//! store.ensure_initialized().await?;
//!
//! // Local write: stamped updated_at, synced=0, eligible for the next push.
//! let serde_json::Value::Object(fields) = json!({
//!     "id": "m1",
//!     "name": "Oatmeal",
//!     "calories": 320,
//!     "date": "2025-02-01",
//! }) else { unreachable!() };
//! store.write_local(&MEAL_ENTRIES, fields)?;
//!
//! let row = store.get_by_id(&MEAL_ENTRIES, "m1", false)?.expect("stored");
//! assert!(!row.synced);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod migrate;
pub mod outbox;
pub mod rows;
pub mod seed;
pub mod store;
pub mod time;

mod schema;
mod tables;

pub use config::{
    replicated_tables, table_by_local_name, FieldMap, ShapeHook, TableConfig, EXERCISES,
    EXERCISE_ENTRIES, HEALTH_SUMMARIES, MEAL_ENTRIES, NUTRITION_TARGETS, SESSION_EXERCISES,
    SESSION_SETS, TEMPLATE_EXERCISES, TEMPLATE_SETS, WORKOUT_EVENTS, WORKOUT_SESSIONS,
    WORKOUT_TEMPLATES,
};
pub use error::{Result, StoreError};
pub use migrate::LEGACY_MIGRATION_SENTINEL;
pub use outbox::{OutboxEntry, OutboxOp};
pub use rows::StoredRow;
pub use seed::SYSTEM_ID_PREFIX;
pub use store::LocalStore;
pub use time::{cmp_timestamps, now_iso, parse_iso};

/// Type aliases for clarity
pub type RecordId = String;
pub type TableName = String;
pub type UserId = String;
