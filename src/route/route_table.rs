use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::discover::{Registry, UpdateListener};
use crate::model::{Kv, ServerInfo};

pub const ROUTE_IP_PREFIX: &str = "/routeip";

fn instance_key(namespace: &str, service_name: &str, instance_id: &str) -> String {
    format!("{namespace}/{service_name}/{instance_id}")
}

fn extract_instance_key(key: &str) -> Option<(&str, &str, &str)> {
    let trimmed = key.strip_prefix('/')?;
    let mut parts = trimmed.splitn(4, '/');
    let _routeip = parts.next()?;
    let namespace = parts.next()?;
    let service_name = parts.next()?;
    let instance_id = parts.next()?;
    Some((namespace, service_name, instance_id))
}

/// `map<(namespace,serviceName,instanceId), ServerInfo>`, fed by registry
/// events under `/routeip`.
pub struct RouteTable {
    table: RwLock<HashMap<String, ServerInfo>>,
}

impl RouteTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(HashMap::new()),
        })
    }

    /// Builds a `RouteTable` and registers it against the route-ip prefix
    /// on `registry`, mirroring `NewRouteTable`.
    pub async fn attach(registry: &Arc<Registry>) -> Arc<Self> {
        let table = Self::new();
        registry.monitor(ROUTE_IP_PREFIX, table.clone()).await;
        table
    }

    pub fn get_server_info(&self, namespace: &str, service_name: &str, instance_id: &str) -> Option<ServerInfo> {
        let key = instance_key(namespace, service_name, instance_id);
        self.table.read().get(&key).cloned()
    }
}

impl UpdateListener for RouteTable {
    fn on_add(&self, kv: Kv) {
        let Some((namespace, service_name, instance_id)) = extract_instance_key(&kv.key) else {
            return;
        };
        let info: ServerInfo = match serde_json::from_str(&kv.val) {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(key = %kv.key, error = %err, "failed to decode service info");
                return;
            }
        };
        let key = instance_key(namespace, service_name, instance_id);
        self.table.write().insert(key, info);
    }

    fn on_delete(&self, kv: Kv) {
        let Some((namespace, service_name, instance_id)) = extract_instance_key(&kv.key) else {
            return;
        };
        let key = instance_key(namespace, service_name, instance_id);
        self.table.write().remove(&key);
    }
}
