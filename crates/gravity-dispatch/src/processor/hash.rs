//! Partition-key hashing and worker assignment.
//!
//! The partition key hashes with `FxHasher` (stable across processes, so
//! the `Gravity-Partition-Key` header is reproducible) and maps to a worker
//! lane with jump consistent hashing, which keeps key→worker affinity
//! nearly intact when the worker count changes.

use std::hash::Hasher;

use rustc_hash::FxHasher;

/// Stable 64-bit hash of a primary-key string.
#[must_use]
pub fn pk_hash(primary_key: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(primary_key.as_bytes());
    hasher.finish()
}

/// Jump consistent hash (Lamping & Veach): maps `key` to a bucket in
/// `[0, buckets)`. Changing `buckets` from n to n+1 moves only ~1/(n+1)
/// of the keys.
#[must_use]
pub fn jump_consistent_hash(key: u64, buckets: u32) -> u32 {
    debug_assert!(buckets > 0);
    let mut key = key;
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < i64::from(buckets) {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        let shifted = ((key >> 33) + 1) as f64;
        #[allow(clippy::cast_possible_truncation)]
        {
            j = (((b.wrapping_add(1)) as f64) * ((1_i64 << 31) as f64) / shifted) as i64;
        }
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        b as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pk_hash_is_stable() {
        assert_eq!(pk_hash("101"), pk_hash("101"));
        assert_ne!(pk_hash("101"), pk_hash("102"));
    }

    #[test]
    fn test_jump_hash_in_range() {
        for key in 0..1000_u64 {
            let bucket = jump_consistent_hash(key, 7);
            assert!(bucket < 7);
        }
    }

    #[test]
    fn test_jump_hash_single_bucket() {
        for key in [0, 1, u64::MAX] {
            assert_eq!(jump_consistent_hash(key, 1), 0);
        }
    }

    #[test]
    fn test_jump_hash_deterministic() {
        for key in 0..100_u64 {
            assert_eq!(
                jump_consistent_hash(key, 16),
                jump_consistent_hash(key, 16)
            );
        }
    }

    #[test]
    fn test_jump_hash_minimal_movement() {
        // Growing from 8 to 9 buckets should move only a small fraction of
        // keys (~1/9 in expectation).
        let total = 10_000_u64;
        let moved = (0..total)
            .filter(|&key| jump_consistent_hash(key, 8) != jump_consistent_hash(key, 9))
            .count();
        assert!(
            moved < (total as usize) / 4,
            "too many keys moved: {moved}/{total}"
        );
    }

    #[test]
    fn test_jump_hash_spreads_keys() {
        let mut counts = [0_usize; 4];
        for key in 0..4000_u64 {
            counts[jump_consistent_hash(key, 4) as usize] += 1;
        }
        for count in counts {
            assert!(count > 500, "bucket underloaded: {counts:?}");
        }
    }
}
