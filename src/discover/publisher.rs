use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::MeshError;
use crate::store::{CoordinationStore, LeaseId};

/// Keeps one key/value pair alive under a bounded-TTL lease, re-registering
/// under a fresh lease whenever the old one is lost.
pub struct Publisher {
    store: Arc<dyn CoordinationStore>,
    key: String,
    value: String,
    ttl: Duration,
    recovery_interval: Duration,
    lease: Mutex<Option<LeaseId>>,
    quit_tx: watch::Sender<bool>,
    registrations: AtomicU64,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
        recovery_interval: Duration,
    ) -> Arc<Self> {
        let (quit_tx, _) = watch::channel(false);
        Arc::new(Self {
            store,
            key: key.into(),
            value: value.into(),
            ttl,
            recovery_interval,
            lease: Mutex::new(None),
            quit_tx,
            registrations: AtomicU64::new(0),
        })
    }

    pub fn current_lease(&self) -> Option<LeaseId> {
        *self.lease.lock()
    }

    /// Number of times this publisher has granted a lease, including the
    /// first one. Used by tests to confirm a revival actually re-registered.
    pub fn registration_count(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    /// `KeepAlive()`: grant a lease, put the key under it, and spawn the
    /// renewal task. Only the first grant/put error is returned
    /// synchronously.
    pub async fn keep_alive(self: &Arc<Self>) -> Result<(), MeshError> {
        let lease = self.do_register().await?;
        self.spawn_keep_alive(lease);
        Ok(())
    }

    /// `Stop()`: signal every live task to revoke and exit. No further puts
    /// or leases are issued afterward.
    pub fn stop(&self) {
        let _ = self.quit_tx.send(true);
    }

    async fn do_register(&self) -> Result<LeaseId, MeshError> {
        let lease = self.store.grant(self.ttl).await?;
        self.store.put(&self.key, &self.value, Some(lease)).await?;
        *self.lease.lock() = Some(lease);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(lease)
    }

    fn spawn_keep_alive(self: &Arc<Self>, lease: LeaseId) {
        let this = self.clone();
        tokio::spawn(async move { this.keep_alive_loop(lease).await });
    }

    async fn keep_alive_loop(self: Arc<Self>, lease: LeaseId) {
        let mut quit_rx = self.quit_tx.subscribe();
        if *quit_rx.borrow() {
            return;
        }

        let mut ch = match self.store.keep_alive(lease).await {
            Ok(ch) => ch,
            Err(err) => {
                tracing::warn!(error = %err, "publisher keep_alive failed to start");
                self.recover(quit_rx).await;
                return;
            }
        };

        loop {
            tokio::select! {
                renewed = ch.recv() => match renewed {
                    Some(()) => continue,
                    None => {
                        self.revoke_best_effort(lease).await;
                        self.recover(quit_rx).await;
                        return;
                    }
                },
                _ = quit_rx.changed() => {
                    self.revoke_best_effort(lease).await;
                    return;
                }
            }
        }
    }

    /// A ticker that retries registration until success or `quit`,
    /// returning directly once re-registration succeeds.
    async fn recover(self: &Arc<Self>, mut quit_rx: watch::Receiver<bool>) {
        if *quit_rx.borrow() {
            return;
        }
        let mut tick = tokio::time::interval(self.recovery_interval);
        loop {
            tokio::select! {
                _ = quit_rx.changed() => return,
                _ = tick.tick() => {
                    match self.do_register().await {
                        Ok(lease) => {
                            self.spawn_keep_alive(lease);
                            return;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "publisher re-registration failed, retrying");
                        }
                    }
                }
            }
        }
    }

    async fn revoke_best_effort(&self, lease: LeaseId) {
        if let Err(err) = self.store.revoke(lease).await {
            tracing::warn!(error = %err, "publisher revoke failed");
        }
    }
}
