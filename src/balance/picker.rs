use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::balance::balancer::SubConnHandle;
use crate::balance::ring::Ring;
use crate::error::MeshError;
use crate::model::ServerInfo;

pub const RANDOM: &str = "random";
pub const WEIGHT_RANDOM: &str = "weight_random";
pub const KETAMA_HASH: &str = "ketama_hash";

/// Per-call override of the dial-time load-balancing policy/hash key.
///
/// gRPC carries this through outgoing call metadata
/// (`mini.request.lbPolicy` / `mini.request.hashKey`); Rust has no ambient
/// per-call context to smuggle it through, so callers pass it explicitly.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub lb_policy: Option<String>,
    pub hash_key: Option<String>,
}

/// A single shared, properly seeded generator for every random/weighted
/// pick, rather than a fresh one constructed per call.
static SHARED_RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::from_entropy()));

/// Immutable per-epoch decision function mapping a call to a
/// sub-connection.
pub enum Picker {
    /// Aggregated balancer state is `TransientFailure`; every pick fails
    /// with the merged resolver/connection error.
    Error(String),
    Ready(ReadyPicker),
}

impl Picker {
    /// Builds the ready-state picker for the current ready set.
    pub fn build_ready(
        default_policy: String,
        ready: Vec<(ServerInfo, Arc<dyn SubConnHandle>)>,
        ketama_virtual_nodes: u32,
    ) -> Self {
        let mut pre_weight = Vec::with_capacity(ready.len());
        let mut total: u64 = 0;
        for (info, _) in &ready {
            total += info.weight.max(1) as u64;
            pre_weight.push(total);
        }

        let ring = if ready.is_empty() {
            None
        } else {
            let mut ring = Ring::new(ketama_virtual_nodes);
            let members: Vec<(String, u32)> =
                ready.iter().map(|(info, _)| (info.address(), info.weight.max(1))).collect();
            ring.set_members(&members);
            Some(ring)
        };

        Picker::Ready(ReadyPicker {
            default_policy,
            ready,
            pre_weight,
            ring,
        })
    }

    pub fn pick(&self, call: &CallOptions) -> Result<Arc<dyn SubConnHandle>, MeshError> {
        match self {
            Picker::Error(msg) => Err(MeshError::TransientFailure(msg.clone())),
            Picker::Ready(picker) => picker.pick(call),
        }
    }
}

pub struct ReadyPicker {
    default_policy: String,
    ready: Vec<(ServerInfo, Arc<dyn SubConnHandle>)>,
    pre_weight: Vec<u64>,
    ring: Option<Ring>,
}

impl ReadyPicker {
    /// `Pick(info)`: zero ready instances fails outright, a
    /// single ready instance is returned unconditionally (no policy
    /// dispatch needed), otherwise the per-call override (if any) takes
    /// precedence over the dial-time policy.
    fn pick(&self, call: &CallOptions) -> Result<Arc<dyn SubConnHandle>, MeshError> {
        if self.ready.is_empty() {
            return Err(MeshError::NoSubConnAvailable);
        }
        if self.ready.len() == 1 {
            return Ok(self.ready[0].1.clone());
        }

        let policy = call.lb_policy.as_deref().unwrap_or(&self.default_policy);
        let hash_key = call.hash_key.as_deref().unwrap_or("");

        match policy {
            RANDOM => self.pick_random(),
            WEIGHT_RANDOM => self.pick_weight_random(),
            KETAMA_HASH => self.pick_ketama(hash_key),
            _ => self.pick_random(),
        }
    }

    fn pick_random(&self) -> Result<Arc<dyn SubConnHandle>, MeshError> {
        let idx = {
            let mut rng = SHARED_RNG.lock();
            rng.gen_range(0..self.ready.len())
        };
        Ok(self.ready[idx].1.clone())
    }

    /// `WeightRandom`: `bound = preWeight[n-1]` (the total
    /// weight), draw `x` in `[1, bound]`, return the first instance whose
    /// inclusive prefix sum is `>= x`.
    fn pick_weight_random(&self) -> Result<Arc<dyn SubConnHandle>, MeshError> {
        let bound = match self.pre_weight.last() {
            Some(&b) if b > 0 => b,
            _ => return self.pick_random(),
        };
        let x = {
            let mut rng = SHARED_RNG.lock();
            rng.gen_range(1..=bound)
        };
        let idx = self.pre_weight.partition_point(|&w| w < x);
        Ok(self.ready[idx].1.clone())
    }

    /// `KetamaWeight`: hash `hash_key` onto the ring; fail if
    /// the key maps nowhere or the resolved address is no longer ready.
    fn pick_ketama(&self, hash_key: &str) -> Result<Arc<dyn SubConnHandle>, MeshError> {
        let ring = self.ring.as_ref().ok_or(MeshError::NoSubConnAvailable)?;
        let addr = ring.get(hash_key).ok_or(MeshError::NoSubConnAvailable)?;
        self.ready
            .iter()
            .find(|(info, _)| info.address() == addr)
            .map(|(_, sc)| sc.clone())
            .ok_or(MeshError::NoSubConnAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

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

    fn info(host: &str, port: u16, weight: u32) -> ServerInfo {
        ServerInfo {
            namespace: "default".into(),
            service_name: "echo".into(),
            instance_id: format!("{host}:{port}"),
            weight,
            host: host.to_string(),
            port,
            metadata: HashMap::new(),
        }
    }

    fn ready_set(weights: &[u32]) -> Vec<(ServerInfo, Arc<dyn SubConnHandle>)> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                let addr = format!("h{i}:{i}");
                let info = info(&format!("h{i}"), i as u16, w);
                let sc: Arc<dyn SubConnHandle> = Arc::new(FakeSubConn { addr });
                (info, sc)
            })
            .collect()
    }

    #[test]
    fn empty_ready_set_fails() {
        let picker = Picker::build_ready(RANDOM.to_string(), Vec::new(), 160);
        assert!(matches!(
            picker.pick(&CallOptions::default()),
            Err(MeshError::NoSubConnAvailable)
        ));
    }

    #[test]
    fn single_ready_instance_short_circuits_policy() {
        let picker = Picker::build_ready(KETAMA_HASH.to_string(), ready_set(&[1]), 160);
        let sc = picker.pick(&CallOptions::default()).unwrap();
        assert_eq!(sc.address(), "h0:0");
    }

    #[test]
    fn weight_random_distribution_matches_weights() {
        let picker = Picker::build_ready(WEIGHT_RANDOM.to_string(), ready_set(&[1, 2, 1]), 160);
        let mut counts = [0u32; 3];
        for _ in 0..4000 {
            let sc = picker.pick(&CallOptions::default()).unwrap();
            let idx: usize = sc.address().split(':').nth(1).unwrap().parse().unwrap();
            counts[idx] += 1;
        }
        assert!((800..1200).contains(&counts[0]), "{:?}", counts);
        assert!((1800..2200).contains(&counts[1]), "{:?}", counts);
        assert!((800..1200).contains(&counts[2]), "{:?}", counts);
    }

    #[test]
    fn ketama_is_stable_for_a_fixed_key() {
        let picker = Picker::build_ready(KETAMA_HASH.to_string(), ready_set(&[1, 1]), 160);
        let call = CallOptions {
            lb_policy: None,
            hash_key: Some("user-42".to_string()),
        };
        let first = picker.pick(&call).unwrap().address().to_string();
        for _ in 0..1000 {
            let again = picker.pick(&call).unwrap().address().to_string();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn per_call_override_wins_over_dial_time_policy() {
        let picker = Picker::build_ready(KETAMA_HASH.to_string(), ready_set(&[1, 1]), 160);
        let call = CallOptions {
            lb_policy: Some(RANDOM.to_string()),
            hash_key: Some("user-42".to_string()),
        };
        // Should not panic/err even without a meaningful hash key, since the
        // override routes this call through the random path instead.
        for _ in 0..20 {
            picker.pick(&call).unwrap();
        }
    }
}
