use crate::errors::AppError;
use crate::models::Record;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type ChangeCallback = Arc<dyn Fn(&[Record]) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&AppError) + Send + Sync>;

struct Listener {
    path: String,
    on_change: ChangeCallback,
    on_error: ErrorCallback,
    state: Arc<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    active: AtomicBool,
    last_revision: AtomicU64,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    listeners: HashMap<u64, Listener>,
}

// Each snapshot carries its path revision. A listener never receives a
// revision older than one it has already seen.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &str, on_change: ChangeCallback, on_error: ErrorCallback) -> Subscription {
        let state = Arc::new(ListenerState {
            active: AtomicBool::new(true),
            last_revision: AtomicU64::new(0),
        });
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.listeners.insert(
            id,
            Listener {
                path: path.to_string(),
                on_change,
                on_error,
                state: state.clone(),
            },
        );
        Subscription {
            id,
            path: path.to_string(),
            state,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_watched(&self, path: &str) -> bool {
        self.lock().listeners.values().any(|listener| listener.path == path)
    }

    pub fn subscribed_paths(&self) -> BTreeSet<String> {
        self.lock()
            .listeners
            .values()
            .map(|listener| listener.path.clone())
            .collect()
    }

    pub fn notify(&self, path: &str, revision: u64, snapshot: &[Record]) {
        deliver(self.change_targets(Some(path), None), revision, snapshot, false);
    }

    pub fn deliver_to(&self, subscription_id: u64, revision: u64, snapshot: &[Record]) {
        deliver(self.change_targets(None, Some(subscription_id)), revision, snapshot, false);
    }

    pub fn redeliver(&self, path: &str, revision: u64, snapshot: &[Record]) {
        deliver(self.change_targets(Some(path), None), revision, snapshot, true);
    }

    pub fn notify_error(&self, error: &AppError) {
        let targets: Vec<(Arc<ListenerState>, ErrorCallback)> = self
            .lock()
            .listeners
            .values()
            .map(|listener| (listener.state.clone(), listener.on_error.clone()))
            .collect();
        for (state, on_error) in targets {
            if state.active.load(Ordering::Acquire) {
                on_error(error);
            }
        }
    }

    fn change_targets(
        &self,
        path: Option<&str>,
        subscription_id: Option<u64>,
    ) -> Vec<(Arc<ListenerState>, ChangeCallback)> {
        self.lock()
            .listeners
            .iter()
            .filter(|(id, listener)| {
                path.map_or(true, |path| listener.path == path)
                    && subscription_id.map_or(true, |wanted| **id == wanted)
            })
            .map(|(_, listener)| (listener.state.clone(), listener.on_change.clone()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// Stamps are revision + 1 so that revision 0 (an untouched path) still
// counts as newer than "nothing delivered yet".
fn deliver(
    targets: Vec<(Arc<ListenerState>, ChangeCallback)>,
    revision: u64,
    snapshot: &[Record],
    force: bool,
) {
    let stamp = revision + 1;
    for (state, on_change) in targets {
        let previous = state.last_revision.fetch_max(stamp, Ordering::AcqRel);
        if previous >= stamp && !force {
            continue;
        }
        if state.active.load(Ordering::Acquire) {
            on_change(snapshot);
        }
    }
}

pub struct Subscription {
    id: u64,
    path: String,
    state: Arc<ListenerState>,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    fn release(&self) {
        self.state.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            let mut inner = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.listeners.remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("active", &self.is_active())
            .finish()
    }
}
