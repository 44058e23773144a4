use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single key/value pair as stored in the coordination store.
///
/// `key` is the full path (e.g. `/routeip/default/echo/h1:9000`); `val` is
/// an opaque payload — for service advertisements it is a JSON-encoded
/// [`ServerInfo`], for routing rules it is the prefix string itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Kv {
    pub key: String,
    pub val: String,
}

impl Kv {
    pub fn new(key: impl Into<String>, val: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            val: val.into(),
        }
    }
}

fn default_weight() -> u32 {
    1
}

/// Advertisement payload published under a service's instance key.
///
/// Serialized form must be stable JSON since it crosses the coordination
/// store and is read back by every subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServerInfo {
    /// `instanceId` defaults to `host:port` when not set explicitly.
    pub fn with_default_instance_id(mut self) -> Self {
        if self.instance_id.is_empty() {
            self.instance_id = self.address();
        }
        if self.weight == 0 {
            self.weight = 1;
        }
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
