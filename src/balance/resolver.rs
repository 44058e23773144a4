use std::sync::Arc;

use crate::balance::balancer::Balancer;
use crate::balance::target::DialOptions;
use crate::discover::{Registry, Subscriber};
use crate::model::ServerInfo;
use crate::route::RoutingService;

/// Naming resolver: subscribes to a service's instance prefix and pushes a
/// decoded address/`ServerInfo` list into the balancer on every change.
pub struct NamingResolver {
    balancer: Arc<Balancer>,
    subscriber: Arc<Subscriber>,
    options: DialOptions,
}

impl NamingResolver {
    /// Subscribes under `prefix` and performs the first push before
    /// returning, mirroring the original's `resolv.update()` call
    /// immediately after `AddListener`.
    pub async fn start(
        registry: &Arc<Registry>,
        prefix: &str,
        balancer: Arc<Balancer>,
        options: DialOptions,
    ) -> Arc<Self> {
        let subscriber = Subscriber::subscribe(registry, prefix).await;
        let resolver = Arc::new(Self {
            balancer,
            subscriber,
            options,
        });

        let for_listener = resolver.clone();
        resolver.subscriber.add_listener(move || {
            let resolver = for_listener.clone();
            tokio::spawn(async move {
                resolver.update().await;
            });
        });

        resolver.update().await;
        resolver
    }

    async fn update(self: &Arc<Self>) {
        let values = self.subscriber.values();
        let mut server_infos = Vec::with_capacity(values.len());
        for val in values {
            match serde_json::from_str::<ServerInfo>(&val) {
                Ok(info) => server_infos.push(info),
                Err(err) => tracing::warn!(error = %err, "naming resolver: failed to decode service info"),
            }
        }
        let addresses = server_infos.iter().map(ServerInfo::address).collect();
        if let Err(err) = self
            .balancer
            .update_client_conn_state(addresses, server_infos, self.options.clone())
            .await
        {
            tracing::warn!(error = %err, "naming resolver failed to push balancer state");
        }
    }
}

/// Dynamic-prefix resolver: on each `update`, resolves a single instance
/// through the routing service and pushes it as the sole address. Used
/// when the dial target carries a non-empty `routeKey`.
pub struct DynamicPrefixResolver {
    balancer: Arc<Balancer>,
    routing: Arc<dyn RoutingService>,
    namespace: String,
    service_name: String,
    route_key: String,
    options: DialOptions,
}

impl DynamicPrefixResolver {
    pub fn new(
        balancer: Arc<Balancer>,
        routing: Arc<dyn RoutingService>,
        namespace: String,
        service_name: String,
        route_key: String,
        options: DialOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            balancer,
            routing,
            namespace,
            service_name,
            route_key,
            options,
        })
    }

    pub async fn update(self: &Arc<Self>) {
        match self
            .routing
            .get_one_instance_with_prefix(&self.namespace, &self.service_name, &self.route_key)
            .await
        {
            Ok(instance) => {
                let info = ServerInfo {
                    namespace: instance.namespace,
                    service_name: instance.service_name,
                    instance_id: instance.instance_id,
                    weight: instance.weight,
                    host: instance.host,
                    port: instance.port,
                    metadata: instance.metadata,
                };
                let addr = info.address();
                if let Err(err) = self
                    .balancer
                    .update_client_conn_state(vec![addr], vec![info], self.options.clone())
                    .await
                {
                    tracing::warn!(error = %err, "dynamic prefix resolver failed to push balancer state");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "dynamic prefix resolver lookup failed");
                self.balancer.resolver_error(err.to_string()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::balancer::{ClientConn, ConnState, SubConnHandle};
    use crate::balance::picker::Picker;
    use crate::error::MeshError;
    use crate::route::ResolvedInstance;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    struct FakeSubConn {
        addr: String,
    }

    #[async_trait]
    impl SubConnHandle for FakeSubConn {
        fn address(&self) -> &str {
            &self.addr
        }
        async fn connect(&self) {}
        async fn shutdown(&self) {}
    }

    struct RecordingClientConn {
        states: Mutex<Vec<ConnState>>,
    }

    impl RecordingClientConn {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ClientConn for RecordingClientConn {
        async fn new_sub_conn(&self, addr: &str) -> Result<Arc<dyn SubConnHandle>, MeshError> {
            Ok(Arc::new(FakeSubConn { addr: addr.to_string() }))
        }
        async fn update_state(&self, state: ConnState, _picker: Arc<Picker>) {
            self.states.lock().push(state);
        }
    }

    #[tokio::test]
    async fn naming_resolver_pushes_decoded_instances_to_the_balancer() {
        let store = MemoryStore::new().start();
        let registry = Registry::standalone(store.clone());
        let cc = RecordingClientConn::new();
        let balancer = Balancer::new(cc.clone(), 160);

        let info = ServerInfo {
            namespace: "default".into(),
            service_name: "echo".into(),
            instance_id: "h1:1".into(),
            weight: 1,
            host: "h1".into(),
            port: 1,
            metadata: HashMap::new(),
        };
        store
            .put("/routeip/default/echo/h1:1", &serde_json::to_string(&info).unwrap(), None)
            .await
            .unwrap();

        let _resolver = NamingResolver::start(
            &registry,
            "/routeip/default/echo",
            balancer.clone(),
            DialOptions::default(),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cc.states.lock().iter().any(|s| *s == ConnState::Idle || *s == ConnState::Ready));
    }

    struct FakeRoutingService {
        instance: Mutex<Option<ResolvedInstance>>,
    }

    #[async_trait]
    impl RoutingService for FakeRoutingService {
        async fn get_one_instance_with_prefix(
            &self,
            _namespace: &str,
            _service_name: &str,
            _key: &str,
        ) -> Result<ResolvedInstance, MeshError> {
            self.instance.lock().clone().ok_or(MeshError::NoInstanceFound)
        }

        async fn set_route_rule(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), MeshError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn dynamic_prefix_resolver_pushes_single_resolved_instance() {
        let cc = RecordingClientConn::new();
        let balancer = Balancer::new(cc.clone(), 160);
        let routing: Arc<dyn RoutingService> = Arc::new(FakeRoutingService {
            instance: Mutex::new(Some(ResolvedInstance {
                namespace: "ns".into(),
                service_name: "svc".into(),
                instance_id: "i1".into(),
                host: "10.0.0.1".into(),
                port: 9000,
                weight: 1,
                metadata: HashMap::new(),
            })),
        });

        let resolver = DynamicPrefixResolver::new(
            balancer.clone(),
            routing,
            "ns".to_string(),
            "svc".to_string(),
            "abcd".to_string(),
            DialOptions::default(),
        );
        resolver.update().await;

        assert!(cc.states.lock().iter().any(|s| *s == ConnState::Idle || *s == ConnState::Ready));
    }

    #[tokio::test]
    async fn dynamic_prefix_resolver_reports_resolver_error_on_miss() {
        let cc = RecordingClientConn::new();
        let balancer = Balancer::new(cc.clone(), 160);
        let routing: Arc<dyn RoutingService> = Arc::new(FakeRoutingService {
            instance: Mutex::new(None),
        });

        let resolver = DynamicPrefixResolver::new(
            balancer.clone(),
            routing,
            "ns".to_string(),
            "svc".to_string(),
            "abcd".to_string(),
            DialOptions::default(),
        );
        resolver.update().await;

        assert!(cc.states.lock().iter().any(|s| *s == ConnState::TransientFailure));
    }
}
