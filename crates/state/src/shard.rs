//! Stable shard hashing for partitioned scans.
//!
//! Multiple control-plane replicas can partition global state scans by
//! hashing the node name. The hash must be stable across processes and
//! releases, so this is plain FNV-1a over the UTF-8 bytes rather than
//! `std`'s randomized hasher.

use flux_core::NodeName;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over a byte slice.
#[must_use]
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Returns `true` if `node` falls in shard `index` of `count`.
///
/// A `count` of zero or one means a single owner that sees everything.
#[must_use]
pub fn owns_shard(node: &NodeName, index: u32, count: u32) -> bool {
    if count <= 1 {
        return true;
    }
    fnv1a32(node.as_str().as_bytes()) % count == index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a32_known_vectors() {
        // Reference values for the 32-bit FNV-1a function.
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let node = NodeName::new("web-03").unwrap();
        let h1 = fnv1a32(node.as_str().as_bytes());
        let h2 = fnv1a32(node.as_str().as_bytes());
        assert_eq!(h1, h2);
    }

    #[test]
    fn single_shard_owns_everything() {
        let node = NodeName::new("web-03").unwrap();
        assert!(owns_shard(&node, 0, 0));
        assert!(owns_shard(&node, 0, 1));
    }

    #[test]
    fn exactly_one_shard_owns_each_node() {
        let count = 4;
        for name in ["web-01", "web-02", "db-primary", "cache-7"] {
            let node = NodeName::new(name).unwrap();
            let owners = (0..count).filter(|&i| owns_shard(&node, i, count)).count();
            assert_eq!(owners, 1, "node {name} owned by {owners} shards");
        }
    }

    #[test]
    fn sharding_spreads_nodes() {
        // Not a distribution guarantee, just a sanity check that many
        // nodes do not all land in shard 0.
        let count = 8;
        let in_zero = (0..100)
            .filter(|i| {
                let node = NodeName::new(format!("node-{i}")).unwrap();
                owns_shard(&node, 0, count)
            })
            .count();
        assert!(in_zero < 50, "shard 0 owns {in_zero} of 100 nodes");
    }
}
