use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::config::RegistryConfig;
use crate::discover::listener::UpdateListener;
use crate::model::Kv;
use crate::store::{CoordinationStore, Revision, StoreError, WatchEvent};

const ENDPOINT_SEPARATOR: &str = ",";

/// Builds (or reuses) the `CoordinationStore` backing an endpoint set.
///
/// Modeled as an injected dependency rather than a hardwired constructor so
/// tests can hand every endpoint set the same in-memory store.
pub trait StoreAccessor: Send + Sync {
    fn connect(&self, endpoints: &[String]) -> Arc<dyn CoordinationStore>;
}

/// A `StoreAccessor` that hands out the same pre-built store regardless of
/// the requested endpoint set — what the demo binary and the test suite use
/// in place of a real multi-cluster coordination store.
pub struct StaticStoreAccessor {
    store: Arc<dyn CoordinationStore>,
}

impl StaticStoreAccessor {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }
}

impl StoreAccessor for StaticStoreAccessor {
    fn connect(&self, _endpoints: &[String]) -> Arc<dyn CoordinationStore> {
        self.store.clone()
    }
}

fn normalize_endpoints(endpoints: &[String]) -> String {
    let mut sorted: Vec<&str> = endpoints.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(ENDPOINT_SEPARATOR)
}

static REGISTRIES: Lazy<Mutex<HashMap<String, Arc<Registry>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// `GetRegistry(endpoints) -> Registry`, idempotent per normalized endpoint
/// set, realized as a process-wide singleton table keyed by the sorted,
/// joined endpoint list.
pub fn get_registry(endpoints: &[String], accessor: &dyn StoreAccessor) -> Arc<Registry> {
    let key = normalize_endpoints(endpoints);
    let mut table = REGISTRIES.lock();
    table
        .entry(key)
        .or_insert_with(|| {
            let store = accessor.connect(endpoints);
            Registry::new(store, RegistryConfig::default())
        })
        .clone()
}

/// Only used by tests that want a fresh singleton table between cases.
#[cfg(test)]
pub(crate) fn reset_registries() {
    REGISTRIES.lock().clear();
}

struct RegistryState {
    values: HashMap<String, HashMap<String, String>>,
    listeners: HashMap<String, Vec<Arc<dyn UpdateListener>>>,
}

/// Per-endpoint-set subscription layer over a `CoordinationStore`. Owns,
/// per monitored prefix, the last-known snapshot and the listener fan-out
/// list, plus exactly one background watch task.
pub struct Registry {
    store: Arc<dyn CoordinationStore>,
    state: RwLock<RegistryState>,
    watched_prefixes: Mutex<std::collections::HashSet<String>>,
    config: RegistryConfig,
}

impl Registry {
    pub(crate) fn new(store: Arc<dyn CoordinationStore>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            state: RwLock::new(RegistryState {
                values: HashMap::new(),
                listeners: HashMap::new(),
            }),
            watched_prefixes: Mutex::new(std::collections::HashSet::new()),
            config,
        })
    }

    /// Build a registry directly over a given store, bypassing the
    /// process-wide singleton table. Used by tests that want isolation.
    #[cfg(test)]
    pub(crate) fn standalone(store: Arc<dyn CoordinationStore>) -> Arc<Self> {
        Self::new(store, RegistryConfig::default())
    }

    /// Register `listener` against `prefix`: replay the current snapshot as
    /// `on_add` calls, then ensure a single watch task is running for that
    /// prefix.
    pub async fn monitor(self: &Arc<Self>, prefix: &str, listener: Arc<dyn UpdateListener>) {
        let snapshot: Vec<Kv> = {
            let state = self.state.read();
            state
                .values
                .get(prefix)
                .map(|m| m.iter().map(|(k, v)| Kv::new(k.clone(), v.clone())).collect())
                .unwrap_or_default()
        };
        for kv in snapshot {
            listener.on_add(kv);
        }

        {
            let mut state = self.state.write();
            state.listeners.entry(prefix.to_string()).or_default().push(listener);
        }

        let first_watcher = {
            let mut watched = self.watched_prefixes.lock();
            watched.insert(prefix.to_string())
        };
        if first_watcher {
            let rev = self.load(prefix).await;
            let this = self.clone();
            let prefix = prefix.to_string();
            tokio::spawn(async move {
                this.watch_loop(&prefix, rev).await;
            });
        }
    }

    /// `load(p)`: range the store under `p` with a bounded timeout, retrying
    /// forever on error.
    async fn load(self: &Arc<Self>, prefix: &str) -> u64 {
        let timeout = Duration::from_millis(self.config.load_timeout_ms);
        loop {
            match tokio::time::timeout(timeout, self.store.range(prefix)).await {
                Ok(Ok((kvs, rev))) => {
                    self.handle_changes(prefix, kvs);
                    return rev.0;
                }
                Ok(Err(err)) => {
                    tracing::warn!(prefix, error = %err, "registry load failed, retrying");
                }
                Err(_) => {
                    tracing::warn!(prefix, "registry load timed out, retrying");
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.load_retry_interval_ms)).await;
        }
    }

    /// Diffs a freshly loaded snapshot against the current `values[p]`.
    /// When `values[p]` already exists it is left untouched here — only
    /// watch events mutate it — so a reload never regresses state a live
    /// watch has already advanced past. Adds are delivered before deletes.
    fn handle_changes(&self, prefix: &str, kvs: Vec<Kv>) {
        let (listeners, add, remove) = {
            let mut state = self.state.write();
            let listeners = state.listeners.get(prefix).cloned().unwrap_or_default();

            match state.values.get(prefix) {
                None => {
                    let mut vals = HashMap::with_capacity(kvs.len());
                    for kv in &kvs {
                        vals.insert(kv.key.clone(), kv.val.clone());
                    }
                    state.values.insert(prefix.to_string(), vals);
                    (listeners, kvs, Vec::new())
                }
                Some(old) => {
                    let mut new_map = HashMap::with_capacity(kvs.len());
                    for kv in &kvs {
                        new_map.insert(kv.key.as_str(), kv.val.as_str());
                    }
                    let mut remove = Vec::new();
                    for (k, v) in old.iter() {
                        match new_map.get(k.as_str()) {
                            Some(nv) if *nv == v.as_str() => {}
                            _ => remove.push(Kv::new(k.clone(), v.clone())),
                        }
                    }
                    let mut add = Vec::new();
                    for kv in &kvs {
                        match old.get(&kv.key) {
                            Some(ov) if ov == &kv.val => {}
                            _ => add.push(kv.clone()),
                        }
                    }
                    (listeners, add, remove)
                }
            }
        };

        for kv in &add {
            for l in &listeners {
                l.on_add(kv.clone());
            }
        }
        for kv in &remove {
            for l in &listeners {
                l.on_delete(kv.clone());
            }
        }
    }

    /// Reopens the watch stream on any recoverable error, resyncing via
    /// `load` on compaction.
    async fn watch_loop(self: Arc<Self>, prefix: &str, mut rev: u64) {
        loop {
            match self.watch_stream(prefix, rev).await {
                Ok(()) => return,
                Err(StoreError::Compacted) => {
                    tracing::warn!(prefix, rev, "store compacted, resyncing via load");
                    rev = self.load(prefix).await;
                }
                Err(err) => {
                    tracing::warn!(prefix, error = %err, "watch stream closed, reopening");
                }
            }
        }
    }

    async fn watch_stream(&self, prefix: &str, rev: u64) -> Result<(), StoreError> {
        let watch_prefix = make_key_prefix(prefix);
        let from = if rev == 0 { Revision(0) } else { Revision(rev + 1) };
        let mut stream = self.store.watch(&watch_prefix, from, true).await?;
        loop {
            match stream.recv().await {
                Some(Ok(batch)) => self.handle_watch_events(prefix, batch.events),
                Some(Err(err)) => return Err(err),
                None => return Err(StoreError::ChannelClosed),
            }
        }
    }

    fn handle_watch_events(&self, prefix: &str, events: Vec<WatchEvent>) {
        let listeners = {
            let state = self.state.read();
            state.listeners.get(prefix).cloned().unwrap_or_default()
        };

        for event in events {
            match event {
                WatchEvent::Put(kv) => {
                    {
                        let mut state = self.state.write();
                        state
                            .values
                            .entry(prefix.to_string())
                            .or_default()
                            .insert(kv.key.clone(), kv.val.clone());
                    }
                    for l in &listeners {
                        l.on_add(kv.clone());
                    }
                }
                WatchEvent::Delete(kv) => {
                    {
                        let mut state = self.state.write();
                        if let Some(vals) = state.values.get_mut(prefix) {
                            vals.remove(&kv.key);
                        }
                    }
                    // Listeners should key off `kv.key` only: a lease
                    // expiry reports a blank value.
                    for l in &listeners {
                        l.on_delete(kv.clone());
                    }
                }
            }
        }
    }
}

/// Appends the path delimiter so watching `/routeip/ns/svc` does not
/// also observe `/routeip/ns/svc2`. Only the watch path needs this;
/// `range` uses the bare prefix.
fn make_key_prefix(prefix: &str) -> String {
    format!("{prefix}/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingListener {
        adds: Mutex<Vec<Kv>>,
        deletes: Mutex<Vec<Kv>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                adds: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
            })
        }
    }

    impl UpdateListener for RecordingListener {
        fn on_add(&self, kv: Kv) {
            self.adds.lock().push(kv);
        }
        fn on_delete(&self, kv: Kv) {
            self.deletes.lock().push(kv);
        }
    }

    #[tokio::test]
    async fn monitor_replays_snapshot_then_streams_updates() {
        let store = MemoryStore::new().start();
        store
            .put("/routeip/default/echo/h1:1", "v1", None)
            .await
            .unwrap();

        let registry = Registry::standalone(store.clone());
        let listener = RecordingListener::new();
        registry.monitor("/routeip/default/echo", listener.clone()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(listener.adds.lock().len(), 1);

        store
            .put("/routeip/default/echo/h2:2", "v2", None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.adds.lock().len(), 2);
    }

    #[tokio::test]
    async fn at_most_one_watcher_per_prefix() {
        let store = MemoryStore::new().start();
        let registry = Registry::standalone(store.clone());

        let before = registry.watched_prefixes.lock().len();
        assert_eq!(before, 0);

        let l1 = RecordingListener::new();
        let l2 = RecordingListener::new();
        registry.monitor("/routeip/default/echo", l1).await;
        registry.monitor("/routeip/default/echo", l2).await;

        assert_eq!(registry.watched_prefixes.lock().len(), 1);
        assert_eq!(
            registry.state.read().listeners.get("/routeip/default/echo").unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn reload_delivers_adds_before_deletes() {
        let store = MemoryStore::new();
        store
            .put("/routeip/default/echo/h1:1", "v1", None)
            .await
            .unwrap();
        store
            .put("/routeip/default/echo/h2:2", "v2", None)
            .await
            .unwrap();

        let registry = Registry::standalone(Arc::new(store));
        // Seed an existing snapshot directly, bypassing watch, to exercise
        // handle_changes' diff path rather than its first-load path.
        {
            let mut state = registry.state.write();
            let mut vals = HashMap::new();
            vals.insert("/routeip/default/echo/h1:1".to_string(), "v1".to_string());
            vals.insert("/routeip/default/echo/h3:3".to_string(), "stale".to_string());
            state.values.insert("/routeip/default/echo".to_string(), vals);
        }

        let listener = RecordingListener::new();
        {
            let mut state = registry.state.write();
            state
                .listeners
                .entry("/routeip/default/echo".to_string())
                .or_default()
                .push(listener.clone());
        }

        registry.load("/routeip/default/echo").await;

        assert_eq!(listener.adds.lock().len(), 1);
        assert_eq!(listener.adds.lock()[0].key, "/routeip/default/echo/h2:2");
        assert_eq!(listener.deletes.lock().len(), 1);
        assert_eq!(listener.deletes.lock()[0].key, "/routeip/default/echo/h3:3");
    }

    #[test]
    fn get_registry_is_idempotent_per_endpoint_set() {
        reset_registries();
        let calls = Arc::new(AtomicUsize::new(0));

        struct CountingAccessor {
            calls: Arc<AtomicUsize>,
        }
        impl StoreAccessor for CountingAccessor {
            fn connect(&self, _endpoints: &[String]) -> Arc<dyn CoordinationStore> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Arc::new(MemoryStore::new())
            }
        }

        let accessor = CountingAccessor { calls: calls.clone() };
        let eps = vec!["a:1".to_string(), "b:2".to_string()];
        let r1 = get_registry(&eps, &accessor);
        let r2 = get_registry(&["b:2".to_string(), "a:1".to_string()], &accessor);
        assert!(Arc::ptr_eq(&r1, &r2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
