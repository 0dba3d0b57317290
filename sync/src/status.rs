//! Observable sync status.
//!
//! Status flows through a small signal abstraction rather than bare callback
//! arrays: subscribers can be added and removed, dispatch is single-shot, and
//! a new subscriber sees the current value synchronously on registration.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Engine state as shown to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Error,
}

/// The observable status record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    /// Number of parked outbox entries.
    pub queue_size: usize,
    /// Message of the most recent failure, if any.
    pub last_error: Option<String>,
    /// When that failure happened (ISO-8601 UTC).
    pub last_error_at: Option<String>,
}

/// Handle returned by `subscribe`; pass back to `unsubscribe`.
pub type SubscriptionId = u64;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    current: T,
    subscribers: Vec<(SubscriptionId, Callback<T>)>,
    next_id: SubscriptionId,
}

/// A stateful signal: holds the latest value, replays it to new subscribers,
/// and dispatches every emission to all current subscribers exactly once.
pub struct Signal<T> {
    inner: Mutex<SignalInner<T>>,
}

impl<T: Clone> Signal<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Mutex::new(SignalInner {
                current: initial,
                subscribers: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Register a subscriber. The current value is delivered synchronously
    /// before this returns.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let callback: Callback<T> = Arc::new(callback);
        let (id, current) = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.push((id, callback.clone()));
            (id, inner.current.clone())
        };
        callback(&current);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Replace the current value and dispatch it to every subscriber.
    pub fn emit(&self, value: T) {
        let (value, subscribers) = {
            let mut inner = self.lock();
            inner.current = value.clone();
            (value, inner.subscribers.clone())
        };
        // Dispatch outside the lock so a callback may re-enter the signal.
        for (_, callback) in subscribers {
            callback(&value);
        }
    }

    /// Mutate the current value in place and dispatch the result.
    pub fn update(&self, mutate: impl FnOnce(&mut T)) {
        let (value, subscribers) = {
            let mut inner = self.lock();
            mutate(&mut inner.current);
            (inner.current.clone(), inner.subscribers.clone())
        };
        for (_, callback) in subscribers {
            callback(&value);
        }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.lock().current.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SignalInner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

type Listener = Arc<dyn Fn() + Send + Sync>;

/// A plain listener set for payload-less notifications (sync-complete).
/// Unlike [`Signal`], registration does not fire.
#[derive(Default)]
pub struct ListenerSet {
    inner: Mutex<(Vec<(SubscriptionId, Listener)>, SubscriptionId)>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((Vec::new(), 1)),
        }
    }

    pub fn add(&self, listener: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        let mut inner = self.lock();
        let id = inner.1;
        inner.1 += 1;
        inner.0.push((id, Arc::new(listener)));
        id
    }

    pub fn remove(&self, id: SubscriptionId) {
        self.lock().0.retain(|(sub_id, _)| *sub_id != id);
    }

    pub fn fire(&self) {
        let listeners: Vec<Listener> =
            self.lock().0.iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener();
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, (Vec<(SubscriptionId, Listener)>, SubscriptionId)> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
