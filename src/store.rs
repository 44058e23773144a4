//! The coordination store boundary.
//!
//! This crate treats the strongly-consistent coordination store (e.g. an
//! etcd-like cluster) as an external collaborator specified only by its
//! interface: grant-lease, put-with-lease, keep-alive, range-with-prefix and
//! prefix-watch-from-revision. [`CoordinationStore`] is that interface;
//! [`MemoryStore`] is an in-process reference implementation used by the
//! demo binary and the test suite. It is not a substitute for a real
//! coordination store in production.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::error::StoreError;
use crate::model::Kv;

pub type LeaseId = u64;

/// Monotonic store revision. Watches resume from a revision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Revision(pub u64);

/// One mutation observed by a prefix watch.
#[derive(Clone, Debug)]
pub enum WatchEvent {
    Put(Kv),
    Delete(Kv),
}

/// A batch of watch events delivered at a single revision, mirroring an
/// etcd watch response.
#[derive(Clone, Debug)]
pub struct WatchBatch {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// A live prefix watch. `recv()` returns `None` once the stream is closed;
/// callers must reopen unless the accompanying error indicates compaction.
pub struct WatchStream {
    rx: mpsc::Receiver<Result<WatchBatch, StoreError>>,
}

impl WatchStream {
    pub async fn recv(&mut self) -> Option<Result<WatchBatch, StoreError>> {
        self.rx.recv().await
    }
}

/// Abstract contract for the coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Grant a new lease with the given time-to-live.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Revoke a lease immediately, deleting any keys still attached to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Put `key`=`val`, optionally attached to a lease.
    async fn put(&self, key: &str, val: &str, lease: Option<LeaseId>)
        -> Result<Revision, StoreError>;

    /// Start a keep-alive session for `lease`. The returned channel yields
    /// one message per successful renewal and closes when the lease is
    /// lost (expired, revoked out-of-band, or the store is unreachable).
    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<()>, StoreError>;

    /// Fetch every key currently live under `prefix`, plus the revision of
    /// that snapshot.
    async fn range(&self, prefix: &str) -> Result<(Vec<Kv>, Revision), StoreError>;

    /// Open a watch over `prefix` starting at `from_revision` (0 means
    /// "from now"). `require_leader` models etcd's `WithRequireLeader`: the
    /// watch fails outright if the store has no leader.
    async fn watch(
        &self,
        prefix: &str,
        from_revision: Revision,
        require_leader: bool,
    ) -> Result<WatchStream, StoreError>;
}

struct LeaseRecord {
    expires_at: Instant,
    ttl: Duration,
    keys: HashSet<String>,
}

struct Inner {
    values: BTreeMap<String, String>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease: LeaseId,
    revision: u64,
    leader_available: bool,
    compacted_below: u64,
}

/// In-memory reference [`CoordinationStore`].
///
/// Mutations are serialized under a single lock and broadcast to all open
/// watches; each watch filters the global stream down to its own prefix.
/// `force_expire_lease`/`compact`/`set_leader_available` are test-only hooks
/// used to exercise the registry's recovery paths.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<(Revision, WatchEvent)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                values: BTreeMap::new(),
                leases: HashMap::new(),
                next_lease: 1,
                revision: 0,
                leader_available: true,
                compacted_below: 0,
            })),
            events,
        }
    }

    /// Wrap in an `Arc` and start the lease-expiry sweeper, which deletes
    /// keys whose lease has lapsed without renewal.
    pub fn start(self) -> Arc<Self> {
        let store = Arc::new(self);
        let weak = Arc::downgrade(&store);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(200));
            loop {
                tick.tick().await;
                let Some(store) = weak.upgrade() else {
                    return;
                };
                store.sweep_expired_leases();
            }
        });
        store
    }

    fn sweep_expired_leases(&self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = {
            let inner = self.inner.lock();
            inner
                .leases
                .iter()
                .filter(|(_, rec)| rec.expires_at <= now)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in expired {
            self.delete_lease_keys(id);
        }
    }

    fn delete_lease_keys(&self, lease: LeaseId) {
        let removed: Vec<Kv> = {
            let mut inner = self.inner.lock();
            let Some(rec) = inner.leases.remove(&lease) else {
                return;
            };
            let mut removed = Vec::with_capacity(rec.keys.len());
            for key in rec.keys {
                if let Some(val) = inner.values.remove(&key) {
                    removed.push(Kv::new(key, val));
                }
            }
            removed
        };
        for kv in removed {
            let mut inner = self.inner.lock();
            inner.revision += 1;
            let rev = Revision(inner.revision);
            drop(inner);
            let _ = self.events.send((rev, WatchEvent::Delete(kv)));
        }
    }

    /// Test hook: force a lease out of existence without waiting for TTL
    /// expiry or going through `revoke`.
    pub fn force_expire_lease(&self, lease: LeaseId) {
        self.delete_lease_keys(lease);
    }

    /// Test hook: mark everything at or below `rev` as compacted, so the
    /// next watch attempt resuming from such a revision reports
    /// `StoreError::Compacted`.
    pub fn compact(&self, rev: u64) {
        self.inner.lock().compacted_below = rev;
    }

    pub fn set_leader_available(&self, available: bool) {
        self.inner.lock().leader_available = available;
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let mut inner = self.inner.lock();
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            LeaseRecord {
                expires_at: Instant::now() + ttl,
                ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.delete_lease_keys(lease);
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        val: &str,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        let rev = {
            let mut inner = self.inner.lock();
            if let Some(lease_id) = lease {
                let rec = inner
                    .leases
                    .get_mut(&lease_id)
                    .ok_or_else(|| StoreError::Unavailable("unknown lease".into()))?;
                rec.keys.insert(key.to_string());
            }
            inner.values.insert(key.to_string(), val.to_string());
            inner.revision += 1;
            Revision(inner.revision)
        };
        let _ = self.events.send((rev, WatchEvent::Put(Kv::new(key, val))));
        Ok(rev)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<()>, StoreError> {
        let ttl = {
            let inner = self.inner.lock();
            inner
                .leases
                .get(&lease)
                .map(|r| r.ttl)
                .ok_or_else(|| StoreError::Unavailable("unknown lease".into()))?
        };

        let (tx, rx) = mpsc::channel(4);
        let period = (ttl / 3).max(Duration::from_millis(10));
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let still_alive = {
                    let mut inner = inner.lock();
                    match inner.leases.get_mut(&lease) {
                        Some(rec) => {
                            rec.expires_at = Instant::now() + rec.ttl;
                            true
                        }
                        None => false,
                    }
                };
                if !still_alive || tx.send(()).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn range(&self, prefix: &str) -> Result<(Vec<Kv>, Revision), StoreError> {
        let inner = self.inner.lock();
        let kvs = inner
            .values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| Kv::new(k.clone(), v.clone()))
            .collect();
        Ok((kvs, Revision(inner.revision)))
    }

    async fn watch(
        &self,
        prefix: &str,
        from_revision: Revision,
        require_leader: bool,
    ) -> Result<WatchStream, StoreError> {
        {
            let inner = self.inner.lock();
            if require_leader && !inner.leader_available {
                return Err(StoreError::NoLeader);
            }
            if from_revision.0 != 0 && from_revision.0 <= inner.compacted_below {
                return Err(StoreError::Compacted);
            }
        }

        let mut events_rx = self.events.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok((rev, event)) => {
                        let key = match &event {
                            WatchEvent::Put(kv) | WatchEvent::Delete(kv) => &kv.key,
                        };
                        if !key.starts_with(&prefix) {
                            continue;
                        }
                        let batch = WatchBatch {
                            revision: rev,
                            events: vec![event],
                        };
                        if tx.send(Ok(batch)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = tx.send(Err(StoreError::ChannelClosed)).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // A slow watcher falling behind the broadcast buffer
                        // is indistinguishable from compaction to the caller:
                        // both mean "resync from a fresh snapshot".
                        let _ = tx.send(Err(StoreError::Compacted)).await;
                        return;
                    }
                }
            }
        });

        Ok(WatchStream { rx })
    }
}
