use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::balance::picker::{CallOptions, Picker};
use crate::balance::target::DialOptions;
use crate::error::MeshError;
use crate::model::ServerInfo;

/// Connectivity state of one sub-connection, modeled after gRPC's
/// `connectivity.State`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// Transport-framework handle to one backend endpoint. This trait is the
/// seam an RPC transport framework implements; this crate only drives it.
#[async_trait]
pub trait SubConnHandle: Send + Sync {
    fn address(&self) -> &str;
    async fn connect(&self);
    async fn shutdown(&self);
}

/// Framework-provided client-connection handle the balancer pushes state
/// and pickers into.
#[async_trait]
pub trait ClientConn: Send + Sync {
    async fn new_sub_conn(&self, addr: &str) -> Result<Arc<dyn SubConnHandle>, MeshError>;
    async fn update_state(&self, state: ConnState, picker: Arc<Picker>);
}

/// Standard connectivity-state evaluator:
/// any Ready ⇒ Ready; else any Connecting ⇒ Connecting; else any Idle ⇒
/// Idle; else TransientFailure.
#[derive(Default)]
struct ConnectivityStateEvaluator {
    num_ready: i64,
    num_connecting: i64,
    num_idle: i64,
    num_transient_failure: i64,
}

impl ConnectivityStateEvaluator {
    fn record_transition(&mut self, old: ConnState, new: ConnState) -> ConnState {
        for (state, delta) in [(old, -1i64), (new, 1i64)] {
            match state {
                ConnState::Ready => self.num_ready += delta,
                ConnState::Connecting => self.num_connecting += delta,
                ConnState::Idle => self.num_idle += delta,
                ConnState::TransientFailure => self.num_transient_failure += delta,
                ConnState::Shutdown => {}
            }
        }
        if self.num_ready > 0 {
            ConnState::Ready
        } else if self.num_connecting > 0 {
            ConnState::Connecting
        } else if self.num_idle > 0 {
            ConnState::Idle
        } else {
            ConnState::TransientFailure
        }
    }
}

struct Inner {
    next_id: u64,
    addr_to_id: HashMap<String, u64>,
    handles: HashMap<u64, Arc<dyn SubConnHandle>>,
    sc_states: HashMap<u64, ConnState>,
    server_infos: Vec<ServerInfo>,
    dial_options: Option<DialOptions>,
    state: ConnState,
    evaluator: ConnectivityStateEvaluator,
    resolver_err: Option<String>,
    conn_err: Option<String>,
    ketama_virtual_nodes: u32,
}

/// Owns sub-connection state and rebuilds the picker. One `Balancer` exists
/// per client connection.
pub struct Balancer {
    cc: Arc<dyn ClientConn>,
    inner: RwLock<Inner>,
}

impl Balancer {
    pub fn new(cc: Arc<dyn ClientConn>, ketama_virtual_nodes: u32) -> Arc<Self> {
        Arc::new(Self {
            cc,
            inner: RwLock::new(Inner {
                next_id: 0,
                addr_to_id: HashMap::new(),
                handles: HashMap::new(),
                sc_states: HashMap::new(),
                server_infos: Vec::new(),
                dial_options: None,
                state: ConnState::Idle,
                evaluator: ConnectivityStateEvaluator::default(),
                resolver_err: None,
                conn_err: None,
                ketama_virtual_nodes,
            }),
        })
    }

    /// `UpdateClientConnState`. Zero addresses is surfaced as
    /// `BadResolverState` and moves the aggregated state to
    /// `TransientFailure`.
    pub async fn update_client_conn_state(
        self: &Arc<Self>,
        addresses: Vec<String>,
        server_infos: Vec<ServerInfo>,
        dial_options: DialOptions,
    ) -> Result<(), MeshError> {
        {
            let mut inner = self.inner.write().await;
            if inner.dial_options.is_none() {
                inner.dial_options = Some(dial_options.clone());
            }
            inner.server_infos = server_infos;
        }

        if addresses.is_empty() {
            self.resolver_error("produced zero addresses".to_string()).await;
            return Err(MeshError::BadResolverState);
        }

        {
            let mut inner = self.inner.write().await;
            inner.resolver_err = None;
        }

        for addr in &addresses {
            self.ensure_sub_conn(addr).await;
        }

        let addr_set: std::collections::HashSet<&str> =
            addresses.iter().map(String::as_str).collect();
        let stale: Vec<(String, u64)> = {
            let inner = self.inner.read().await;
            inner
                .addr_to_id
                .iter()
                .filter(|(addr, _)| !addr_set.contains(addr.as_str()))
                .map(|(addr, id)| (addr.clone(), *id))
                .collect()
        };
        for (addr, id) in stale {
            let handle = {
                let mut inner = self.inner.write().await;
                inner.addr_to_id.remove(&addr);
                // The transport's own `Shutdown(addr)` callback arrives later
                // and is keyed by address, which no longer resolves once
                // `addr_to_id` is pruned above. Clean up `sc_states` and the
                // evaluator count here instead of relying on that callback.
                if let Some(old_state) = inner.sc_states.remove(&id) {
                    inner.state = inner.evaluator.record_transition(old_state, ConnState::Shutdown);
                }
                inner.handles.remove(&id)
            };
            if let Some(handle) = handle {
                handle.shutdown().await;
            }
        }

        self.regenerate_and_push().await;
        Ok(())
    }

    async fn ensure_sub_conn(self: &Arc<Self>, addr: &str) {
        // Held across the async `new_sub_conn` call so concurrent creates for
        // the same address can't race past the existence check.
        let mut inner = self.inner.write().await;
        if inner.addr_to_id.contains_key(addr) {
            return;
        }
        let handle = match self.cc.new_sub_conn(addr).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(addr, error = %err, "balancer failed to create sub-connection");
                return;
            }
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.addr_to_id.insert(addr.to_string(), id);
        inner.handles.insert(id, handle.clone());
        inner.sc_states.insert(id, ConnState::Idle);
        inner.state = inner.evaluator.record_transition(ConnState::Shutdown, ConnState::Idle);
        drop(inner);
        handle.connect().await;
    }

    /// `UpdateSubConnState`. Guards against unknown
    /// sub-connections and spurious `TransientFailure -> {Connecting,Idle}`
    /// transitions (prevents flapping).
    pub async fn update_sub_conn_state(
        self: &Arc<Self>,
        addr: &str,
        new_state: ConnState,
        conn_err: Option<String>,
    ) {
        let id = match self.inner.read().await.addr_to_id.get(addr).copied() {
            Some(id) => id,
            None => {
                tracing::warn!(addr, "balancer got state change for unknown sub-connection");
                return;
            }
        };

        let old_state = {
            let inner = self.inner.read().await;
            match inner.sc_states.get(&id).copied() {
                Some(s) => s,
                None => return,
            }
        };

        if old_state == ConnState::TransientFailure
            && matches!(new_state, ConnState::Connecting | ConnState::Idle)
        {
            if new_state == ConnState::Idle {
                if let Some(handle) = self.inner.read().await.handles.get(&id).cloned() {
                    handle.connect().await;
                }
            }
            return;
        }

        let aggregated = {
            let mut inner = self.inner.write().await;
            inner.sc_states.insert(id, new_state);
            if new_state == ConnState::Shutdown {
                inner.sc_states.remove(&id);
            }
            if new_state == ConnState::TransientFailure {
                inner.conn_err = conn_err.clone();
            }
            inner.state = inner.evaluator.record_transition(old_state, new_state);
            inner.state
        };

        if new_state == ConnState::Idle {
            if let Some(handle) = self.inner.read().await.handles.get(&id).cloned() {
                handle.connect().await;
            }
        }

        let ready_flipped = (new_state == ConnState::Ready) != (old_state == ConnState::Ready);
        if ready_flipped || aggregated == ConnState::TransientFailure {
            self.regenerate_and_push().await;
        } else {
            let picker = self.current_picker().await;
            self.cc.update_state(aggregated, picker).await;
        }
    }

    /// `ResolverError`.
    pub async fn resolver_error(self: &Arc<Self>, err: String) {
        let state = {
            let mut inner = self.inner.write().await;
            inner.resolver_err = Some(err);
            if inner.handles.is_empty() {
                inner.state = ConnState::TransientFailure;
            }
            inner.state
        };
        if state != ConnState::TransientFailure {
            return;
        }
        self.regenerate_and_push().await;
    }

    async fn current_picker(self: &Arc<Self>) -> Arc<Picker> {
        let inner = self.inner.read().await;
        Arc::new(self.build_picker(&inner))
    }

    async fn regenerate_and_push(self: &Arc<Self>) {
        let (state, picker) = {
            let inner = self.inner.read().await;
            (inner.state, Arc::new(self.build_picker(&inner)))
        };
        self.cc.update_state(state, picker).await;
    }

    fn build_picker(&self, inner: &Inner) -> Picker {
        if inner.state == ConnState::TransientFailure {
            let msg = match (&inner.conn_err, &inner.resolver_err) {
                (Some(c), Some(r)) => format!("last connection error: {c}; last resolver error: {r}"),
                (Some(c), None) => format!("last connection error: {c}"),
                (None, Some(r)) => format!("last resolver error: {r}"),
                (None, None) => "no ready sub-connections".to_string(),
            };
            return Picker::Error(msg);
        }

        let ready_addrs: HashMap<&str, &Arc<dyn SubConnHandle>> = inner
            .addr_to_id
            .iter()
            .filter_map(|(addr, id)| {
                if inner.sc_states.get(id).copied() == Some(ConnState::Ready) {
                    inner.handles.get(id).map(|h| (addr.as_str(), h))
                } else {
                    None
                }
            })
            .collect();

        let ready: Vec<(ServerInfo, Arc<dyn SubConnHandle>)> = inner
            .server_infos
            .iter()
            .filter_map(|info| {
                ready_addrs
                    .get(info.address().as_str())
                    .map(|h| (info.clone(), (*h).clone()))
            })
            .collect();

        let default_policy = inner
            .dial_options
            .as_ref()
            .map(|o| o.lb_policy.clone())
            .unwrap_or_default();

        Picker::build_ready(default_policy, ready, inner.ketama_virtual_nodes)
    }

    pub async fn pick(self: &Arc<Self>, call: &CallOptions) -> Result<Arc<dyn SubConnHandle>, MeshError> {
        let picker = self.current_picker().await;
        picker.pick(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::target::DialOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSubConn {
        addr: String,
        connects: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl SubConnHandle for FakeSubConn {
        fn address(&self) -> &str {
            &self.addr
        }
        async fn connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeClientConn {
        created: Mutex<Vec<String>>,
        pushes: Mutex<Vec<ConnState>>,
    }

    use parking_lot::Mutex;

    impl FakeClientConn {
        fn new() -> Self {
            Self {
                created: Mutex::new(Vec::new()),
                pushes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ClientConn for FakeClientConn {
        async fn new_sub_conn(&self, addr: &str) -> Result<Arc<dyn SubConnHandle>, MeshError> {
            self.created.lock().push(addr.to_string());
            Ok(Arc::new(FakeSubConn {
                addr: addr.to_string(),
                connects: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            }))
        }
        async fn update_state(&self, state: ConnState, _picker: Arc<Picker>) {
            self.pushes.lock().push(state);
        }
    }

    fn dial_opts() -> DialOptions {
        DialOptions {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            namespace: "default".to_string(),
            lb_policy: "random".to_string(),
            dst_metadata: HashMap::new(),
            route_key: String::new(),
            hash_key: String::new(),
        }
    }

    /// Property 8: zero addresses is surfaced as `BadResolverState` and the
    /// aggregated state moves to `TransientFailure`.
    #[tokio::test]
    async fn empty_address_list_is_bad_resolver_state() {
        let cc = Arc::new(FakeClientConn::new());
        let balancer = Balancer::new(cc.clone(), 160);

        let err = balancer
            .update_client_conn_state(Vec::new(), Vec::new(), dial_opts())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::BadResolverState));

        let inner = balancer.inner.read().await;
        assert_eq!(inner.state, ConnState::TransientFailure);
    }

    #[tokio::test]
    async fn new_addresses_create_idle_sub_conns_and_connect() {
        let cc = Arc::new(FakeClientConn::new());
        let balancer = Balancer::new(cc.clone(), 160);

        balancer
            .update_client_conn_state(vec!["h1:1".into()], Vec::new(), dial_opts())
            .await
            .unwrap();

        assert_eq!(cc.created.lock().as_slice(), ["h1:1"]);
        let inner = balancer.inner.read().await;
        assert_eq!(inner.sc_states.len(), 1);
    }

    #[tokio::test]
    async fn removed_addresses_are_shut_down() {
        let cc = Arc::new(FakeClientConn::new());
        let balancer = Balancer::new(cc.clone(), 160);

        balancer
            .update_client_conn_state(vec!["h1:1".into(), "h2:2".into()], Vec::new(), dial_opts())
            .await
            .unwrap();
        balancer
            .update_client_conn_state(vec!["h1:1".into()], Vec::new(), dial_opts())
            .await
            .unwrap();

        let inner = balancer.inner.read().await;
        assert_eq!(inner.addr_to_id.len(), 1);
        assert!(inner.addr_to_id.contains_key("h1:1"));
        assert_eq!(inner.sc_states.len(), 1, "stale sub-conn's state must not leak");
    }

    /// A sub-conn that drops out of the resolved address set must not leave
    /// a stale `Ready` count behind in the evaluator: once every real
    /// connection is gone, aggregated state must reflect that instead of
    /// staying falsely `Ready`.
    #[tokio::test]
    async fn evaluator_does_not_leak_ready_count_for_removed_sub_conn() {
        let cc = Arc::new(FakeClientConn::new());
        let balancer = Balancer::new(cc.clone(), 160);

        balancer
            .update_client_conn_state(vec!["h1:1".into()], Vec::new(), dial_opts())
            .await
            .unwrap();
        balancer.update_sub_conn_state("h1:1", ConnState::Ready, None).await;
        assert_eq!(balancer.inner.read().await.state, ConnState::Ready);

        // Resolver swaps h1:1 out for h2:2 before the transport's own
        // Shutdown("h1:1") callback arrives.
        balancer
            .update_client_conn_state(vec!["h2:2".into()], Vec::new(), dial_opts())
            .await
            .unwrap();

        {
            let inner = balancer.inner.read().await;
            assert!(!inner.addr_to_id.contains_key("h1:1"));
            assert_eq!(inner.sc_states.len(), 1, "h1:1's state must not leak");
            // h1:1 was Ready and is now gone; h2:2 starts Idle, so
            // aggregated state must drop out of Ready rather than staying
            // falsely Ready off the leaked count.
            assert_eq!(inner.state, ConnState::Idle);
        }

        // The transport's later Shutdown(addr) callback for the
        // already-pruned address is a no-op, not a panic or a leak.
        balancer.update_sub_conn_state("h1:1", ConnState::Shutdown, None).await;
        let inner = balancer.inner.read().await;
        assert_eq!(inner.sc_states.len(), 1);
    }

    /// A spurious `TransientFailure -> Connecting`/`Idle` transition must not
    /// update the aggregated state (prevents flapping); `Idle` still
    /// triggers a reconnect attempt.
    #[tokio::test]
    async fn transient_failure_to_idle_is_spurious_but_reconnects() {
        let cc = Arc::new(FakeClientConn::new());
        let balancer = Balancer::new(cc.clone(), 160);
        balancer
            .update_client_conn_state(vec!["h1:1".into()], Vec::new(), dial_opts())
            .await
            .unwrap();

        balancer
            .update_sub_conn_state("h1:1", ConnState::TransientFailure, Some("boom".into()))
            .await;
        let state_before = balancer.inner.read().await.state;

        balancer.update_sub_conn_state("h1:1", ConnState::Idle, None).await;

        let state_after = balancer.inner.read().await.state;
        assert_eq!(state_before, state_after);

        let handle = {
            let inner = balancer.inner.read().await;
            let id = inner.addr_to_id["h1:1"];
            inner.handles[&id].clone()
        };
        assert_eq!(handle.address(), "h1:1");
    }

    #[tokio::test]
    async fn ready_membership_flip_rebuilds_picker_and_pushes_ready() {
        let cc = Arc::new(FakeClientConn::new());
        let balancer = Balancer::new(cc.clone(), 160);
        balancer
            .update_client_conn_state(vec!["h1:1".into()], Vec::new(), dial_opts())
            .await
            .unwrap();

        balancer.update_sub_conn_state("h1:1", ConnState::Ready, None).await;

        let inner = balancer.inner.read().await;
        assert_eq!(inner.state, ConnState::Ready);
        assert!(cc.pushes.lock().contains(&ConnState::Ready));
    }

    #[tokio::test]
    async fn unknown_sub_conn_state_change_is_ignored() {
        let cc = Arc::new(FakeClientConn::new());
        let balancer = Balancer::new(cc.clone(), 160);
        balancer.update_sub_conn_state("ghost:1", ConnState::Ready, None).await;
        let inner = balancer.inner.read().await;
        assert!(inner.sc_states.is_empty());
    }
}
