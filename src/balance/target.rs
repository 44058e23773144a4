use std::collections::HashMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

pub const ETCD_SCHEME: &str = "etcd";

fn default_namespace() -> String {
    "default".to_string()
}

/// Dial-time options carried in the target URL's `options` query parameter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialOptions {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub lb_policy: String,
    #[serde(default)]
    pub dst_metadata: HashMap<String, String>,
    #[serde(default)]
    pub route_key: String,
    #[serde(default)]
    pub hash_key: String,
}

/// A parsed dial target: `<scheme>://<service>[?options=<base64url-json>]`.
/// Scheme `etcd` activates discovery; any other scheme is passed through
/// untouched.
#[derive(Clone, Debug)]
pub struct DialTarget {
    pub scheme: String,
    pub service: String,
    pub options: DialOptions,
}

impl DialTarget {
    pub fn discovery_enabled(&self) -> bool {
        self.scheme == ETCD_SCHEME
    }
}

/// Parses a dial target, decoding the `options` query parameter if present.
pub fn parse_dial_target(target: &str) -> Result<DialTarget, MeshError> {
    let (scheme, rest) = target
        .split_once("://")
        .ok_or_else(|| MeshError::BadTarget(target.to_string()))?;

    let (service, query) = match rest.split_once('?') {
        Some((service, query)) => (service, Some(query)),
        None => (rest, None),
    };
    if service.is_empty() {
        return Err(MeshError::BadTarget(target.to_string()));
    }

    let mut options = DialOptions {
        namespace: default_namespace(),
        ..Default::default()
    };

    if let Some(query) = query {
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if key != "options" || value.is_empty() {
                continue;
            }
            let decoded = base64::engine::general_purpose::URL_SAFE
                .decode(value)
                .map_err(|e| MeshError::BadTarget(format!("bad options encoding: {e}")))?;
            options = serde_json::from_slice(&decoded)?;
            if options.namespace.is_empty() {
                options.namespace = default_namespace();
            }
        }
    }

    Ok(DialTarget {
        scheme: scheme.to_string(),
        service: service.to_string(),
        options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_target_has_default_namespace_and_no_options() {
        let target = parse_dial_target("etcd://echo").unwrap();
        assert_eq!(target.scheme, "etcd");
        assert_eq!(target.service, "echo");
        assert_eq!(target.options.namespace, "default");
        assert!(target.options.route_key.is_empty());
    }

    #[test]
    fn options_query_param_is_decoded() {
        let json = r#"{"endpoints":["127.0.0.1:2379"],"namespace":"prod","lbPolicy":"ketama_hash","hashKey":"user-42"}"#;
        let encoded = base64::engine::general_purpose::URL_SAFE.encode(json);
        let target = parse_dial_target(&format!("etcd://echo?options={encoded}")).unwrap();
        assert_eq!(target.options.namespace, "prod");
        assert_eq!(target.options.lb_policy, "ketama_hash");
        assert_eq!(target.options.hash_key, "user-42");
        assert_eq!(target.options.endpoints, vec!["127.0.0.1:2379".to_string()]);
    }

    #[test]
    fn non_etcd_scheme_bypasses_discovery() {
        let target = parse_dial_target("dns://echo").unwrap();
        assert!(!target.discovery_enabled());
    }

    #[test]
    fn missing_scheme_separator_is_rejected() {
        assert!(parse_dial_target("echo").is_err());
    }
}
