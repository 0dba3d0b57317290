//! # Tempo Sync
//!
//! Bidirectional replication between the embedded `tempo-store` database and
//! a hosted backend. The app keeps reading and writing locally at all times;
//! this crate reconciles in the background and never blocks local access.
//!
//! ## How a pass works
//!
//! [`SyncEngine::full_sync`] runs pull → push → outbox drain → cleanup:
//!
//! - **Pull** fetches the user's rows per table and merges them under
//!   last-write-wins on `updated_at`; pending local deletes and strictly
//!   newer local edits win. Rows the server no longer has are swept.
//! - **Push** walks unsynced local rows: tombstones become remote deletes,
//!   and edits are upserted unless the server copy is strictly newer (ties go
//!   to the client). Ownership rejections evict the local copy; transient
//!   failures park the operation in the outbox.
//! - **Drain** replays parked operations with exponential back-off (1 s base,
//!   60 s cap) and drops entries after five failed attempts.
//! - **Cleanup** hard-deletes confirmed tombstones.
//!
//! Exactly one pass runs at a time: concurrent `full_sync` callers join the
//! in-flight pass, and the debounced re-push gives way to a running sync.
//!
//! ## Realtime
//!
//! [`SyncEngine::init_realtime`] opens one change-feed channel per table.
//! Deltas apply directly unless a local unsynced edit exists, in which case
//! the engine defers the delta and schedules a debounced re-push (~750 ms) so
//! the local edit competes through the normal push path.
//!
//! ## Observability
//!
//! [`SyncStatus`] (`idle`/`syncing`/`error`, queue size, last error) is
//! observable via [`SyncEngine::subscribe_status`]; new subscribers receive
//! the current status synchronously. Sync-complete callbacks fire after any
//! change to local state, from any direction.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use tempo_store::LocalStore;
//! use tempo_sync::{testing::InMemoryGateway, SyncEngine};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(LocalStore::open_in_memory()?);
//! store.ensure_initialized().await?;
//!
//! let gateway = Arc::new(InMemoryGateway::new());
//! let engine = SyncEngine::new(store, gateway, "user-1");
//!
//! let summary = engine.full_sync().await;
//! assert!(summary.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod outbox;
pub mod status;
pub mod testing;

pub use adapter::{AppliedEvent, PullReport, PushReport, SyncContext};
pub use engine::{SyncEngine, SyncSummary, REALTIME_DEBOUNCE};
pub use error::{Result, SyncError};
pub use gateway::{
    classify_code, ChangeEvent, GatewayError, RemoteGateway, CODE_MALFORMED_IDENTIFIER,
    CODE_NOT_FOUND, CODE_PERMISSION_DENIED,
};
pub use outbox::{compute_backoff, DrainReport, BACKOFF_BASE, BACKOFF_CAP, MAX_RETRY_ATTEMPTS};
pub use status::{ListenerSet, Signal, SubscriptionId, SyncState, SyncStatus};
