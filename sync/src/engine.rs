//! The sync engine: owns the end-to-end replication protocol.
//!
//! One engine value is constructed at startup from the store, the gateway
//! and the active session, and passed down; the single-flight slot, the
//! `is_syncing` gate and the debounce timer are fields on it, not globals.

use crate::adapter::{self, AppliedEvent, SyncContext};
use crate::error::{Result, SyncError};
use crate::gateway::{ChangeEvent, RemoteGateway};
use crate::outbox;
use crate::status::{ListenerSet, Signal, SubscriptionId, SyncState, SyncStatus};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempo_store::{now_iso, replicated_tables, LocalStore, TableConfig};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before the re-push triggered by a deferred realtime conflict.
pub const REALTIME_DEBOUNCE: Duration = Duration::from_millis(750);

/// Accounting for one sync pass. Cloneable because joined callers of
/// [`SyncEngine::full_sync`] all receive the same result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Remote rows applied locally by the pull phase.
    pub pulled: usize,
    /// Local rows acknowledged by the server in the push phase.
    pub pushed: usize,
    /// Outbox entries replayed successfully.
    pub drained: usize,
    /// Outbox entries dropped at the retry ceiling.
    pub dead_lettered: usize,
    /// Rows evicted after remote ownership rejections.
    pub purged: usize,
    /// Per-stage failure messages; empty on a clean pass.
    pub errors: Vec<String>,
}

impl SyncSummary {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

type SharedSync = Shared<BoxFuture<'static, SyncSummary>>;

/// Cheaply cloneable handle to the engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<LocalStore>,
    gateway: Arc<dyn RemoteGateway>,
    user_id: String,
    tables: &'static [TableConfig],
    status: Signal<SyncStatus>,
    sync_complete: ListenerSet,
    inflight: Mutex<Option<SharedSync>>,
    /// The one arbiter for pass execution: every pass holds this for its
    /// whole duration, so two passes can never run side by side.
    pass_lock: tokio::sync::Mutex<()>,
    is_syncing: AtomicBool,
    realtime_started: AtomicBool,
    realtime_tasks: Mutex<Vec<JoinHandle<()>>>,
    debounce: Mutex<Option<JoinHandle<()>>>,
    conflicts: Mutex<HashSet<(String, String)>>,
}

impl SyncEngine {
    /// Build an engine for the active session over the full replicated
    /// table set.
    pub fn new(
        store: Arc<LocalStore>,
        gateway: Arc<dyn RemoteGateway>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                gateway,
                user_id: user_id.into(),
                tables: replicated_tables(),
                status: Signal::new(SyncStatus::default()),
                sync_complete: ListenerSet::new(),
                inflight: Mutex::new(None),
                pass_lock: tokio::sync::Mutex::new(()),
                is_syncing: AtomicBool::new(false),
                realtime_started: AtomicBool::new(false),
                realtime_tasks: Mutex::new(Vec::new()),
                debounce: Mutex::new(None),
                conflicts: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Run a complete sync pass: pull, push, drain the outbox, cleanup.
    ///
    /// Single-flight: a caller arriving while a full sync is running
    /// receives the in-flight pass's result instead of starting a second
    /// one, and a pass started by [`upload`](Self::upload) is waited out,
    /// never run beside. Never returns an error; failures surface in the
    /// summary and through the status observer.
    pub async fn full_sync(&self) -> SyncSummary {
        let fut = {
            let mut slot = self.inner.lock_inflight();
            if let Some(existing) = slot.as_ref() {
                debug!("joining in-flight sync pass");
                existing.clone()
            } else {
                let inner = self.inner.clone();
                let fut: SharedSync = async move {
                    let summary = inner.run_full_sync().await;
                    inner.lock_inflight().take();
                    summary
                }
                .boxed()
                .shared();
                *slot = Some(fut.clone());
                fut
            }
        };
        fut.await
    }

    /// Push local changes, drain the outbox, run cleanup. This is the target
    /// of the debounced re-push; re-entry while any pass is running is
    /// rejected and logged.
    pub async fn upload(&self) -> Result<SyncSummary> {
        let Ok(_pass) = self.inner.pass_lock.try_lock() else {
            debug!("upload rejected: sync already in progress");
            return Err(SyncError::AlreadySyncing);
        };
        self.inner.is_syncing.store(true, Ordering::SeqCst);
        let summary = self.inner.run_upload().await;
        self.inner.is_syncing.store(false, Ordering::SeqCst);
        Ok(summary)
    }

    /// Pull-only pass. Never returns an error.
    pub async fn download(&self) -> SyncSummary {
        self.inner.run_download().await
    }

    // ------------------------------------------------------------------
    // Realtime
    // ------------------------------------------------------------------

    /// Open one change-feed channel per replicated table, scoped to the
    /// active user where applicable. A second call is a no-op.
    pub async fn init_realtime(&self) -> Result<()> {
        if self.inner.realtime_started.swap(true, Ordering::SeqCst) {
            debug!("realtime already initialized");
            return Ok(());
        }

        let mut tasks = Vec::new();
        for config in self.inner.tables {
            let scope = config.user_scoped.then_some(self.inner.user_id.as_str());
            match self.inner.gateway.subscribe(config.remote_name, scope).await {
                Ok(mut rx) => {
                    let inner = self.inner.clone();
                    let config = *config;
                    tasks.push(tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            inner.handle_remote_event(&config, event).await;
                        }
                    }));
                }
                Err(err) => {
                    for task in tasks {
                        task.abort();
                    }
                    self.inner.realtime_started.store(false, Ordering::SeqCst);
                    return Err(err.into());
                }
            }
        }

        info!(channels = self.inner.tables.len(), "realtime channels open");
        *self.inner.lock_realtime_tasks() = tasks;
        Ok(())
    }

    /// Cancel the debounce timer and unsubscribe every channel. A later
    /// [`init_realtime`](Self::init_realtime) opens fresh channels against
    /// the current user.
    pub fn cleanup_realtime(&self) {
        if let Some(handle) = self.inner.lock_debounce().take() {
            handle.abort();
        }
        for handle in self.inner.lock_realtime_tasks().drain(..) {
            handle.abort();
        }
        self.inner.realtime_started.store(false, Ordering::SeqCst);
        info!("realtime channels closed");
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Snapshot of the current status.
    pub fn status(&self) -> SyncStatus {
        self.inner.status.get()
    }

    /// Number of parked outbox entries as last observed.
    pub fn queue_size(&self) -> usize {
        self.inner.status.get().queue_size
    }

    /// Subscribe to status updates. The current status is delivered
    /// synchronously before this returns.
    pub fn subscribe_status(
        &self,
        callback: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.status.subscribe(callback)
    }

    pub fn unsubscribe_status(&self, id: SubscriptionId) {
        self.inner.status.unsubscribe(id);
    }

    /// Register a callback fired after any pass or realtime delta that
    /// mutated local state.
    pub fn on_sync_complete(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        self.inner.sync_complete.add(callback)
    }

    pub fn remove_sync_complete(&self, id: SubscriptionId) {
        self.inner.sync_complete.remove(id);
    }
}

impl EngineInner {
    fn context(&self) -> SyncContext<'_> {
        SyncContext {
            store: self.store.as_ref(),
            gateway: self.gateway.as_ref(),
            user_id: &self.user_id,
        }
    }

    async fn run_full_sync(self: &Arc<Self>) -> SyncSummary {
        // An in-flight upload holds the arbiter; wait it out rather than
        // running beside it. Full-sync callers still join through the
        // shared-future slot before ever reaching this point.
        let _pass = self.pass_lock.lock().await;
        self.is_syncing.store(true, Ordering::SeqCst);
        self.set_state(SyncState::Syncing);
        info!(user_id = %self.user_id, "starting full sync");

        let mut summary = SyncSummary::default();
        let mut mutated = false;

        // Pull before push: a freshly signed-in device starts from the
        // server baseline. Push afterwards still wins for locally newer rows
        // because of the per-row timestamp guard.
        self.pull_all(&mut summary, &mut mutated).await;
        self.push_all(&mut summary, &mut mutated).await;
        self.drain(&mut summary, &mut mutated).await;
        self.cleanup(&mut summary, &mut mutated);

        self.finish_pass(&summary);
        self.is_syncing.store(false, Ordering::SeqCst);
        if mutated {
            self.sync_complete.fire();
        }
        summary
    }

    async fn run_upload(self: &Arc<Self>) -> SyncSummary {
        self.set_state(SyncState::Syncing);

        let mut summary = SyncSummary::default();
        let mut mutated = false;

        self.push_all(&mut summary, &mut mutated).await;
        self.drain(&mut summary, &mut mutated).await;
        self.cleanup(&mut summary, &mut mutated);

        self.finish_pass(&summary);
        if mutated {
            self.sync_complete.fire();
        }
        summary
    }

    async fn run_download(self: &Arc<Self>) -> SyncSummary {
        let _pass = self.pass_lock.lock().await;
        self.set_state(SyncState::Syncing);

        let mut summary = SyncSummary::default();
        let mut mutated = false;
        self.pull_all(&mut summary, &mut mutated).await;

        self.finish_pass(&summary);
        if mutated {
            self.sync_complete.fire();
        }
        summary
    }

    /// Tables are processed strictly sequentially; each table pass is caught
    /// independently so one table's failure never aborts the sync.
    async fn pull_all(&self, summary: &mut SyncSummary, mutated: &mut bool) {
        let ctx = self.context();
        for config in self.tables {
            match adapter::pull_table(&ctx, config).await {
                Ok(report) => {
                    summary.pulled += report.applied;
                    if report.applied > 0 || report.swept > 0 {
                        *mutated = true;
                    }
                }
                Err(err) => {
                    warn!(table = config.local_name, error = %err, "pull failed");
                    summary.errors.push(format!("pull {}: {err}", config.local_name));
                }
            }
        }
    }

    async fn push_all(&self, summary: &mut SyncSummary, mutated: &mut bool) {
        let ctx = self.context();
        for config in self.tables {
            match adapter::push_table(&ctx, config).await {
                Ok(report) => {
                    summary.pushed += report.pushed;
                    summary.purged += report.purged;
                    if report.pushed > 0 || report.purged > 0 {
                        *mutated = true;
                    }
                    if report.failed > 0 {
                        summary.errors.push(format!(
                            "push {}: {} rows failed",
                            config.local_name, report.failed
                        ));
                    }
                }
                Err(err) => {
                    warn!(table = config.local_name, error = %err, "push failed");
                    summary.errors.push(format!("push {}: {err}", config.local_name));
                }
            }
        }
        self.refresh_queue_size();
    }

    async fn drain(&self, summary: &mut SyncSummary, mutated: &mut bool) {
        let ctx = self.context();
        match outbox::drain_outbox(&ctx).await {
            Ok(report) => {
                summary.drained = report.replayed;
                summary.dead_lettered = report.dead_lettered;
                summary.purged += report.purged;
                if report.replayed > 0 || report.purged > 0 {
                    *mutated = true;
                }
                if let Some(message) = report.last_error {
                    summary.errors.push(message);
                }
            }
            Err(err) => {
                warn!(error = %err, "outbox drain failed");
                summary.errors.push(format!("outbox drain: {err}"));
            }
        }
        self.refresh_queue_size();
    }

    fn cleanup(&self, summary: &mut SyncSummary, mutated: &mut bool) {
        match self.store.cleanup_deleted() {
            Ok(removed) => {
                if removed > 0 {
                    debug!(removed, "cleanup pass removed confirmed tombstones");
                    *mutated = true;
                }
            }
            Err(err) => {
                warn!(error = %err, "cleanup pass failed");
                summary.errors.push(format!("cleanup: {err}"));
            }
        }
    }

    async fn handle_remote_event(self: &Arc<Self>, config: &TableConfig, event: ChangeEvent) {
        let record_id = event.record_id(config.primary_key);
        let ctx = self.context();
        match adapter::apply_remote_event(&ctx, config, event).await {
            Ok(AppliedEvent::Upserted) | Ok(AppliedEvent::Deleted) => {
                self.sync_complete.fire();
            }
            Ok(AppliedEvent::DeferredConflict) => {
                if let Some(id) = record_id {
                    self.lock_conflicts()
                        .insert((config.local_name.to_string(), id));
                }
                self.schedule_repush();
            }
            Ok(AppliedEvent::Ignored) => {}
            Err(err) => {
                warn!(table = config.local_name, error = %err, "failed to apply realtime delta");
            }
        }
    }

    /// Single-armed debounce: triggers during the window coalesce into the
    /// already-scheduled re-push.
    fn schedule_repush(self: &Arc<Self>) {
        let mut slot = self.lock_debounce();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                debug!("re-push already scheduled, coalescing");
                return;
            }
        }

        let inner = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(REALTIME_DEBOUNCE).await;
            if inner.is_syncing.load(Ordering::SeqCst) {
                debug!("debounced re-push skipped: sync already running");
                return;
            }
            let conflicts = std::mem::take(&mut *inner.lock_conflicts());
            debug!(conflicts = conflicts.len(), "running debounced re-push");
            let engine = SyncEngine { inner };
            if let Err(err) = engine.upload().await {
                debug!(error = %err, "debounced re-push rejected");
            }
        }));
    }

    fn set_state(&self, state: SyncState) {
        self.status.update(|status| status.state = state);
    }

    fn refresh_queue_size(&self) {
        match self.store.outbox_len() {
            Ok(len) => self.status.update(|status| status.queue_size = len),
            Err(err) => warn!(error = %err, "failed to read outbox size"),
        }
    }

    fn finish_pass(&self, summary: &SyncSummary) {
        if summary.is_clean() {
            self.set_state(SyncState::Idle);
        } else {
            let message = summary
                .errors
                .last()
                .cloned()
                .unwrap_or_else(|| "sync failed".to_string());
            error!(error = %message, failures = summary.errors.len(), "sync pass completed with errors");
            self.status.update(|status| {
                status.state = SyncState::Error;
                status.last_error = Some(message.clone());
                status.last_error_at = Some(now_iso());
            });
        }
    }

    fn lock_inflight(&self) -> MutexGuard<'_, Option<SharedSync>> {
        recover(self.inflight.lock())
    }

    fn lock_realtime_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        recover(self.realtime_tasks.lock())
    }

    fn lock_debounce(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        recover(self.debounce.lock())
    }

    fn lock_conflicts(&self) -> MutexGuard<'_, HashSet<(String, String)>> {
        recover(self.conflicts.lock())
    }
}

fn recover<'a, T>(
    result: std::result::Result<MutexGuard<'a, T>, std::sync::PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
