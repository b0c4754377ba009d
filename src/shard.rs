//! Shuffle-shard seeding and zone-balancing helpers.

use std::hash::Hasher;
use twox_hash::XxHash64;

/// Returns the seed for the per-zone random generator used by shuffle
/// sharding.
///
/// The seed is an xxhash64 (seed 0) over the identifier bytes, and the zone
/// bytes separated by a NUL when a zone is set. xxhash is stable across
/// restarts and platforms, so the same (identifier, zone) pair always walks
/// the ring the same way.
pub fn shuffle_shard_seed(identifier: &str, zone: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(identifier.as_bytes());
    if !zone.is_empty() {
        hasher.write(&[0]);
        hasher.write(zone.as_bytes());
    }
    hasher.finish()
}

/// Returns how many instances a shard of `shard_size` should take from each
/// of `num_zones` zones: the ceiling of the division, so the shard never
/// ends up smaller than requested when the size is not a zone multiple.
pub fn shuffle_shard_expected_instances_per_zone(shard_size: usize, num_zones: usize) -> usize {
    shard_size.div_ceil(num_zones)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_deterministic() {
        assert_eq!(
            shuffle_shard_seed("tenant-a", "zone-1"),
            shuffle_shard_seed("tenant-a", "zone-1"),
        );
    }

    #[test]
    fn seed_differs_by_identifier_and_zone() {
        let base = shuffle_shard_seed("tenant-a", "zone-1");
        assert_ne!(base, shuffle_shard_seed("tenant-b", "zone-1"));
        assert_ne!(base, shuffle_shard_seed("tenant-a", "zone-2"));
        assert_ne!(
            shuffle_shard_seed("tenant-a", ""),
            shuffle_shard_seed("tenant-a", "zone-1"),
        );
    }

    #[test]
    fn expected_instances_per_zone_rounds_up() {
        assert_eq!(shuffle_shard_expected_instances_per_zone(6, 3), 2);
        assert_eq!(shuffle_shard_expected_instances_per_zone(7, 3), 3);
        assert_eq!(shuffle_shard_expected_instances_per_zone(1, 3), 1);
        assert_eq!(shuffle_shard_expected_instances_per_zone(0, 3), 0);
    }
}
