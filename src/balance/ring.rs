use twox_hash::XxHash64;
use std::hash::Hasher;

/// Fixed seed so the ring hashes the same way across process restarts.
const RING_SEED: u64 = 0x6761_6d65_726f_7574; // "gamerout" as bytes, arbitrary but fixed

/// Consistent-hash ring with weighted virtual points.
///
/// A value type cached on the balancer and mutated in place via
/// [`Ring::set_members`] whenever the ready set changes.
#[derive(Clone, Debug, Default)]
pub struct Ring {
    /// Sorted `(hash, member_index)` pairs; `members[member_index]` is the
    /// address that virtual point belongs to.
    points: Vec<(u64, u32)>,
    members: Vec<String>,
    virtual_nodes_per_weight: u32,
}

impl Ring {
    pub fn new(virtual_nodes_per_weight: u32) -> Self {
        Self {
            points: Vec::new(),
            members: Vec::new(),
            virtual_nodes_per_weight: virtual_nodes_per_weight.max(1),
        }
    }

    /// Rebuild the ring's virtual-point array for the given `(address,
    /// weight)` members. Each member contributes `weight * V` points.
    pub fn set_members(&mut self, members: &[(String, u32)]) {
        self.members = members.iter().map(|(addr, _)| addr.clone()).collect();
        self.points = Vec::new();
        for (idx, (addr, weight)) in members.iter().enumerate() {
            let count = (*weight).max(1) * self.virtual_nodes_per_weight;
            for v in 0..count {
                let hash = hash_point(addr, v);
                self.points.push((hash, idx as u32));
            }
        }
        self.points.sort_unstable_by_key(|(hash, _)| *hash);
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// `Get(key)`: hash `key`, binary-search for the first point `>= hash`,
    /// wrapping at the end.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        let idx = match self.points.binary_search_by_key(&hash, |(h, _)| *h) {
            Ok(i) => i,
            Err(i) => i % self.points.len(),
        };
        let (_, member_idx) = self.points[idx];
        self.members.get(member_idx as usize).map(String::as_str)
    }
}

fn hash_point(addr: &str, virtual_index: u32) -> u64 {
    let mut hasher = XxHash64::with_seed(RING_SEED);
    hasher.write(addr.as_bytes());
    hasher.write_u32(virtual_index);
    hasher.finish()
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(RING_SEED);
    hasher.write(key.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn get_is_deterministic_for_a_fixed_ring() {
        let mut ring = Ring::new(160);
        ring.set_members(&[("h1:1".into(), 1), ("h2:2".into(), 1), ("h3:3".into(), 1)]);
        let first = ring.get("user-42").map(str::to_string);
        let second = ring.get("user-42").map(str::to_string);
        assert_eq!(first, second);
    }

    #[test]
    fn adding_one_member_remaps_roughly_one_over_n_plus_one_keys() {
        let mut before = Ring::new(160);
        before.set_members(&[("h1:1".into(), 1), ("h2:2".into(), 1), ("h3:3".into(), 1)]);

        let mut after = Ring::new(160);
        after.set_members(&[
            ("h1:1".into(), 1),
            ("h2:2".into(), 1),
            ("h3:3".into(), 1),
            ("h4:4".into(), 1),
        ]);

        let n = 2000;
        let mut remapped = 0;
        for i in 0..n {
            let key = format!("key-{i}");
            if before.get(&key) != after.get(&key) {
                remapped += 1;
            }
        }
        let expected = n as f64 / 5.0; // 1/(n+1) with n=4 existing members
        let ratio = remapped as f64 / expected;
        assert!(ratio > 0.5 && ratio < 2.0, "remap ratio {ratio} out of range");
    }

    #[test]
    fn distribution_is_roughly_uniform_across_equal_weights() {
        let mut ring = Ring::new(160);
        ring.set_members(&[("h1:1".into(), 1), ("h2:2".into(), 1), ("h3:3".into(), 1)]);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for i in 0..9000 {
            let addr = ring.get(&format!("key-{i}")).unwrap().to_string();
            *counts.entry(addr).or_insert(0) += 1;
        }
        for count in counts.values() {
            let share = *count as f64 / 9000.0;
            assert!(share > 0.2 && share < 0.45, "share {share} too skewed");
        }
    }
}
