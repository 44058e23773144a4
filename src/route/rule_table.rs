use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::discover::{Registry, UpdateListener};
use crate::model::Kv;
use crate::route::radix::RadixTree;

pub const ROUTE_RULE_PREFIX: &str = "/rule";

fn service_key(namespace: &str, service_name: &str) -> String {
    format!("{namespace}/{service_name}")
}

/// `namespace, serviceName, prefix` extracted from a `/rule/<ns>/<svc>/<prefix>` key.
fn extract_rule_key(key: &str) -> Option<(&str, &str, &str)> {
    let trimmed = key.strip_prefix('/')?;
    let mut parts = trimmed.splitn(4, '/');
    let _rule = parts.next()?;
    let namespace = parts.next()?;
    let service_name = parts.next()?;
    let prefix = parts.next()?;
    Some((namespace, service_name, prefix))
}

/// `map<(namespace,serviceName), RadixTree<instanceId>>`, fed by registry
/// events under `/rule`.
///
/// The value stored in the coordination store under a rule key is the
/// target `instanceId`; `SetRouteRule` is the sole writer of rule keys.
pub struct RuleTable {
    service_to_prefix: RwLock<HashMap<String, RadixTree>>,
}

impl RuleTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            service_to_prefix: RwLock::new(HashMap::new()),
        })
    }

    /// Builds a `RuleTable` and registers it against the rule prefix on
    /// `registry`.
    pub async fn attach(registry: &Arc<Registry>) -> Arc<Self> {
        let table = Self::new();
        registry.monitor(ROUTE_RULE_PREFIX, table.clone()).await;
        table
    }

    pub fn get_instance_id(&self, namespace: &str, service_name: &str, route_key: &str) -> Option<String> {
        let key = service_key(namespace, service_name);
        let trees = self.service_to_prefix.read();
        let tree = trees.get(&key)?;
        tree.longest_prefix(route_key).map(|(_, instance_id)| instance_id)
    }

    fn update_rule(&self, namespace: &str, service_name: &str, prefix: &str, instance_id: String) {
        let key = service_key(namespace, service_name);
        let mut trees = self.service_to_prefix.write();
        trees.entry(key).or_insert_with(RadixTree::new).insert(prefix, instance_id);
    }

    fn remove_rule(&self, namespace: &str, service_name: &str, prefix: &str) {
        let key = service_key(namespace, service_name);
        let mut trees = self.service_to_prefix.write();
        if let Some(tree) = trees.get_mut(&key) {
            tree.delete(prefix);
        }
    }
}

impl UpdateListener for RuleTable {
    fn on_add(&self, kv: Kv) {
        let Some((namespace, service_name, prefix)) = extract_rule_key(&kv.key) else {
            return;
        };
        self.update_rule(namespace, service_name, prefix, kv.val);
    }

    fn on_delete(&self, kv: Kv) {
        let Some((namespace, service_name, prefix)) = extract_rule_key(&kv.key) else {
            return;
        };
        self.remove_rule(namespace, service_name, prefix);
    }
}
