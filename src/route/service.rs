use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::discover::Registry;
use crate::error::MeshError;
use crate::model::ServerInfo;
use crate::route::route_table::RouteTable;
use crate::route::rule_table::{RuleTable, ROUTE_RULE_PREFIX};
use crate::store::CoordinationStore;

/// Resolved target of `GetOneInstanceWithPrefix`, the routing service's
/// wire-facing shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedInstance {
    pub namespace: String,
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub metadata: HashMap<String, String>,
}

impl ResolvedInstance {
    fn from_server_info(namespace: &str, service_name: &str, instance_id: &str, info: ServerInfo) -> Self {
        Self {
            namespace: namespace.to_string(),
            service_name: service_name.to_string(),
            instance_id: instance_id.to_string(),
            host: info.host,
            port: info.port,
            weight: info.weight,
            metadata: info.metadata,
        }
    }
}

/// The thin RPC façade over the rule/route tables, kept as a trait so the
/// dynamic-prefix resolver can be driven by a fake in tests without an
/// actual RPC transport.
#[async_trait]
pub trait RoutingService: Send + Sync {
    async fn get_one_instance_with_prefix(
        &self,
        namespace: &str,
        service_name: &str,
        key: &str,
    ) -> Result<ResolvedInstance, MeshError>;

    async fn set_route_rule(
        &self,
        namespace: &str,
        service_name: &str,
        prefix: &str,
        instance_id: &str,
    ) -> Result<(), MeshError>;
}

/// Default implementation backed by a `RuleTable` and `RouteTable` fed from
/// the same registry, and a direct store handle for writes.
pub struct DefaultRoutingService {
    store: Arc<dyn CoordinationStore>,
    rule_table: Arc<RuleTable>,
    route_table: Arc<RouteTable>,
}

impl DefaultRoutingService {
    pub async fn new(registry: &Arc<Registry>, store: Arc<dyn CoordinationStore>) -> Arc<Self> {
        let rule_table = RuleTable::attach(registry).await;
        let route_table = RouteTable::attach(registry).await;
        Arc::new(Self {
            store,
            rule_table,
            route_table,
        })
    }
}

#[async_trait]
impl RoutingService for DefaultRoutingService {
    /// `GetOneInstanceWithPrefix`: `RuleTable.LongestPrefix` then
    /// `RouteTable.Get`; errors are `NoInstanceFound` (no matching rule)
    /// and `InstanceOff` (rule matched, instance not currently advertised).
    async fn get_one_instance_with_prefix(
        &self,
        namespace: &str,
        service_name: &str,
        key: &str,
    ) -> Result<ResolvedInstance, MeshError> {
        let instance_id = self
            .rule_table
            .get_instance_id(namespace, service_name, key)
            .ok_or(MeshError::NoInstanceFound)?;

        let info = self
            .route_table
            .get_server_info(namespace, service_name, &instance_id)
            .ok_or_else(|| MeshError::InstanceOff {
                instance_id: instance_id.clone(),
            })?;

        Ok(ResolvedInstance::from_server_info(namespace, service_name, &instance_id, info))
    }

    /// `SetRouteRule`: write `/rule/<ns>/<svc>/<prefix> = <instanceId>`
    /// directly through the shared store client; the `RuleTable` picks the
    /// change up through its own watch.
    async fn set_route_rule(
        &self,
        namespace: &str,
        service_name: &str,
        prefix: &str,
        instance_id: &str,
    ) -> Result<(), MeshError> {
        let key = format!("{ROUTE_RULE_PREFIX}/{namespace}/{service_name}/{prefix}");
        self.store.put(&key, instance_id, None).await?;
        Ok(())
    }
}
