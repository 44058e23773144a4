use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::{routing::get, Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use gamerouter::balance::{
    Balancer, CallOptions, ClientConn, ConnState, DialOptions, NamingResolver, Picker, SubConnHandle,
};
use gamerouter::config::MeshConfig;
use gamerouter::discover::{get_registry, Publisher, Registry, StaticStoreAccessor, Subscriber};
use gamerouter::model::ServerInfo;
use gamerouter::route::DefaultRoutingService;
use gamerouter::store::MemoryStore;

static DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Stand-in transport for the demo binary: marks every sub-connection
/// `Ready` as soon as it is created. The balancer is transport-agnostic;
/// a real integration supplies its own `ClientConn`/`SubConnHandle`.
struct DemoSubConn {
    addr: String,
}

#[async_trait]
impl SubConnHandle for DemoSubConn {
    fn address(&self) -> &str {
        &self.addr
    }
    async fn connect(&self) {}
    async fn shutdown(&self) {}
}

struct DemoClientConn {
    balancer: Mutex<Option<Arc<Balancer>>>,
    last_state: Mutex<ConnState>,
}

impl DemoClientConn {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            balancer: Mutex::new(None),
            last_state: Mutex::new(ConnState::Idle),
        })
    }

    fn attach(&self, balancer: Arc<Balancer>) {
        *self.balancer.lock() = Some(balancer);
    }
}

#[async_trait]
impl ClientConn for DemoClientConn {
    async fn new_sub_conn(&self, addr: &str) -> Result<Arc<dyn SubConnHandle>, gamerouter::MeshError> {
        let handle: Arc<dyn SubConnHandle> = Arc::new(DemoSubConn { addr: addr.to_string() });
        if let Some(balancer) = self.balancer.lock().clone() {
            let addr = addr.to_string();
            tokio::spawn(async move {
                balancer.update_sub_conn_state(&addr, ConnState::Ready, None).await;
            });
        }
        Ok(handle)
    }

    async fn update_state(&self, state: ConnState, _picker: Arc<Picker>) {
        *self.last_state.lock() = state;
    }
}

struct DemoState {
    registry: Arc<Registry>,
    balancer: Arc<Balancer>,
    cc: Arc<DemoClientConn>,
    routing: Arc<DefaultRoutingService>,
    namespace: String,
    service_name: String,
}

async fn instances(State(state): State<Arc<DemoState>>) -> Json<Value> {
    let prefix = format!("/routeip/{}/{}", state.namespace, state.service_name);
    let subscriber = Subscriber::subscribe(&state.registry, &prefix).await;
    Json(json!({ "instances": subscriber.values() }))
}

async fn status(State(state): State<Arc<DemoState>>) -> Json<Value> {
    let picker = state.balancer.pick(&CallOptions::default()).await;
    let ready = picker.is_ok();
    let state_snapshot = *state.cc.last_state.lock();
    let resolved = state
        .routing
        .get_one_instance_with_prefix(&state.namespace, &state.service_name, "")
        .await
        .ok()
        .map(|instance| format!("{}:{}", instance.host, instance.port));
    Json(json!({
        "namespace": state.namespace,
        "aggregated_state": format!("{:?}", state_snapshot),
        "has_ready_sub_conn": ready,
        "routed_instance": resolved,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_target(true)
        .compact()
        .init();

    let cfg_path = env::var("GMR_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = MeshConfig::load_from_path(&PathBuf::from(cfg_path)).unwrap_or_else(|err| {
        info!("no config file found ({err}), using defaults");
        MeshConfig::default()
    });
    info!(namespace = %cfg.namespace, "starting gamerouter demo");

    let store = MemoryStore::new().start();
    let accessor = StaticStoreAccessor::new(store.clone());
    let registry = get_registry(&[], &accessor);

    let service_name = "echo";
    let instance = ServerInfo {
        namespace: cfg.namespace.clone(),
        service_name: service_name.to_string(),
        instance_id: String::new(),
        weight: 1,
        host: "127.0.0.1".to_string(),
        port: 9000,
        metadata: HashMap::new(),
    }
    .with_default_instance_id();

    let instance_key = format!("/routeip/{}/{}/{}", cfg.namespace, service_name, instance.instance_id);
    let publisher = Publisher::new(
        store.clone(),
        instance_key,
        serde_json::to_string(&instance)?,
        std::time::Duration::from_secs(cfg.publisher.lease_ttl_s),
        std::time::Duration::from_millis(cfg.publisher.recovery_interval_ms),
    );
    publisher.keep_alive().await?;

    let cc = DemoClientConn::new();
    let balancer = Balancer::new(cc.clone(), cfg.balancer.ketama_virtual_nodes);
    cc.attach(balancer.clone());

    let prefix = format!("/routeip/{}/{}", cfg.namespace, service_name);
    let _resolver = NamingResolver::start(&registry, &prefix, balancer.clone(), DialOptions::default()).await;

    let routing = DefaultRoutingService::new(&registry, store.clone()).await;
    routing
        .set_route_rule(&cfg.namespace, service_name, "", &instance.instance_id)
        .await?;

    let demo_state = Arc::new(DemoState {
        registry: registry.clone(),
        balancer,
        cc,
        routing,
        namespace: cfg.namespace.clone(),
        service_name: service_name.to_string(),
    });

    let router = Router::new()
        .route("/status", get(status))
        .route("/instances", get(instances))
        .with_state(demo_state);

    let addr: SocketAddr = format!("{}:{}", cfg.demo.status_bind_addr, cfg.demo.status_port).parse()?;
    info!("status endpoint listening on http://{}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    publisher.stop();
    info!("publisher stopped, exiting");
    Ok(())
}

/// Waits for SIGINT (or SIGTERM on unix) so the demo can revoke its lease
/// before exiting instead of leaving the coordination store to notice the
/// lease lapse on its own.
async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
