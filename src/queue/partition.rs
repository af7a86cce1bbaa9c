//! Producer-side partition assignment.
//!
//! By default a message lands in the partition derived from the producing
//! thread, so messages staged from one thread keep their relative order. An
//! explicit key gives a partition that is stable across threads and processes.

use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Partition for the current thread, in `0..partition_count`
pub fn partition_for_current_thread(partition_count: u32) -> i32 {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    reduce(hasher.finish(), partition_count)
}

/// Partition for an explicit key, in `0..partition_count`
///
/// Derived from SHA-256 so the result does not change between processes or
/// releases.
pub fn partition_for_key(key: &str, partition_count: u32) -> i32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    reduce(u64::from_be_bytes(prefix), partition_count)
}

fn reduce(hash: u64, partition_count: u32) -> i32 {
    let count = u64::from(partition_count.max(1));
    // < partition_count, which fits in i32
    (hash % count) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_thread_partition_is_stable() {
        let first = partition_for_current_thread(8);
        for _ in 0..10 {
            assert_eq!(partition_for_current_thread(8), first);
        }
    }

    #[test]
    fn test_single_partition_always_zero() {
        assert_eq!(partition_for_current_thread(1), 0);
        assert_eq!(partition_for_key("anything", 1), 0);
        assert_eq!(partition_for_key("anything", 0), 0);
    }

    #[test]
    fn test_keys_spread_across_partitions() {
        let used: std::collections::HashSet<i32> = (0..64)
            .map(|i| partition_for_key(&format!("order-{i}"), 8))
            .collect();
        assert!(used.len() > 1);
    }

    proptest! {
        #[test]
        fn prop_key_partition_in_range(key in ".*", count in 1u32..1024) {
            let partition = partition_for_key(&key, count);
            prop_assert!(partition >= 0);
            prop_assert!((partition as u32) < count);
        }

        #[test]
        fn prop_key_partition_is_deterministic(key in "[a-z0-9-]{1,32}", count in 1u32..64) {
            prop_assert_eq!(partition_for_key(&key, count), partition_for_key(&key, count));
        }

        #[test]
        fn prop_thread_partition_in_range(count in 1u32..1024) {
            let partition = partition_for_current_thread(count);
            prop_assert!(partition >= 0);
            prop_assert!((partition as u32) < count);
        }
    }
}
