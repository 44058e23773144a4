use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::discover::listener::UpdateListener;
use crate::discover::registry::Registry;
use crate::model::Kv;

type ChangeListener = Box<dyn Fn() + Send + Sync>;

/// Listener view of one monitored prefix. Readers call
/// [`Subscriber::values`]/[`Subscriber::key_values`] and get back an
/// immutable, shared snapshot that is only rebuilt when the mapping has
/// actually changed since the last read.
pub struct Subscriber {
    mapping: Mutex<HashMap<String, String>>,
    snapshot: RwLock<Arc<HashMap<String, String>>>,
    dirty: AtomicBool,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl Subscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mapping: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            dirty: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Builds a subscriber and registers it against `prefix` on `registry`
    /// in one step.
    pub async fn subscribe(registry: &Arc<Registry>, prefix: &str) -> Arc<Self> {
        let sub = Self::new();
        registry.monitor(prefix, sub.clone()).await;
        sub
    }

    /// Registers a side-channel callback fired after every mutation.
    pub fn add_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }

    fn notify_change(&self) {
        let listeners = self.listeners.lock();
        for l in listeners.iter() {
            l();
        }
    }

    /// Stable snapshot of the key/value mapping. Rebuilt only when dirty;
    /// otherwise returns the previously published `Arc`.
    pub fn key_values(&self) -> Arc<HashMap<String, String>> {
        if !self.dirty.load(Ordering::Acquire) {
            return self.snapshot.read().clone();
        }
        let snap = {
            let mapping = self.mapping.lock();
            Arc::new(mapping.clone())
        };
        *self.snapshot.write() = snap.clone();
        self.dirty.store(false, Ordering::Release);
        snap
    }

    /// Values of the current snapshot, in unspecified order (the store
    /// itself is unordered by value).
    pub fn values(&self) -> Vec<String> {
        self.key_values().values().cloned().collect()
    }
}

impl UpdateListener for Subscriber {
    fn on_add(&self, kv: Kv) {
        {
            let mut mapping = self.mapping.lock();
            mapping.insert(kv.key, kv.val);
        }
        self.dirty.store(true, Ordering::Release);
        self.notify_change();
    }

    fn on_delete(&self, kv: Kv) {
        let removed = {
            let mut mapping = self.mapping.lock();
            mapping.remove(&kv.key).is_some()
        };
        if !removed {
            return;
        }
        self.dirty.store(true, Ordering::Release);
        self.notify_change();
    }
}
