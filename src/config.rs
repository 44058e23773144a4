use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Ambient knobs for the discovery/balancing fabric.
///
/// None of this is required to use the library directly — `Registry`,
/// `Publisher` and the balancer all take their timeouts/TTLs as explicit
/// arguments. `MeshConfig` exists to drive the demo binary's startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            registry: RegistryConfig::default(),
            publisher: PublisherConfig::default(),
            balancer: BalancerConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    #[serde(default = "default_load_retry_ms")]
    pub load_retry_interval_ms: u64,
}
fn default_load_timeout_ms() -> u64 {
    3_000
}
fn default_load_retry_ms() -> u64 {
    1_000
}
impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: default_load_timeout_ms(),
            load_retry_interval_ms: default_load_retry_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_lease_ttl_s")]
    pub lease_ttl_s: u64,
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
}
fn default_lease_ttl_s() -> u64 {
    10
}
fn default_recovery_interval_ms() -> u64 {
    1_000
}
impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            lease_ttl_s: default_lease_ttl_s(),
            recovery_interval_ms: default_recovery_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default = "default_ketama_vnodes")]
    pub ketama_virtual_nodes: u32,
}
fn default_ketama_vnodes() -> u32 {
    160
}
impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            ketama_virtual_nodes: default_ketama_vnodes(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DemoConfig {
    #[serde(default = "default_status_bind_addr")]
    pub status_bind_addr: String,
    #[serde(default = "default_status_port")]
    pub status_port: u16,
}
fn default_status_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_status_port() -> u16 {
    8980
}
impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            status_bind_addr: default_status_bind_addr(),
            status_port: default_status_port(),
        }
    }
}

impl MeshConfig {
    pub fn load_from_path(path: &PathBuf) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut cfg: Self = serde_yaml::from_str(&content)?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }
}

/// `GMR_*` environment overrides, applied after loading the config file.
pub fn apply_env_overrides(cfg: &mut MeshConfig) {
    if let Ok(ns) = env::var("GMR_NAMESPACE") {
        cfg.namespace = ns;
    }
    if let Ok(addr) = env::var("GMR_STATUS_ADDR") {
        cfg.demo.status_bind_addr = addr;
    }
    if let Ok(port) = env::var("GMR_STATUS_PORT") {
        if let Ok(p) = port.parse::<u16>() {
            cfg.demo.status_port = p;
        }
    }
    if let Ok(ttl) = env::var("GMR_LEASE_TTL_S") {
        if let Ok(v) = ttl.parse::<u64>() {
            cfg.publisher.lease_ttl_s = v.max(1);
        }
    }
    if let Ok(ms) = env::var("GMR_LOAD_TIMEOUT_MS") {
        if let Ok(v) = ms.parse::<u64>() {
            cfg.registry.load_timeout_ms = v.max(100);
        }
    }
    if let Ok(vnodes) = env::var("GMR_KETAMA_VNODES") {
        if let Ok(v) = vnodes.parse::<u32>() {
            cfg.balancer.ketama_virtual_nodes = v.max(1);
        }
    }
}
