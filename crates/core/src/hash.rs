//! Key hashing for partition routing.
//!
//! The partition contract hashes keys with xxHash64 and takes the result
//! modulo the partition count. [`fnv1a_hash`] is the portable fallback for
//! embedders without a native xxHash implementation; both functions are
//! stable across releases because stored routing decisions depend on them.

use xxhash_rust::xxh64::xxh64;

/// Seed for the partition hash. Changing it reshuffles every partition
/// assignment in an existing cluster.
const PARTITION_HASH_SEED: u64 = 0;

/// Hashes a key with xxHash64 for partition routing.
#[must_use]
pub fn key_hash(key: &str) -> u64 {
    xxh64(key.as_bytes(), PARTITION_HASH_SEED)
}

/// 64-bit FNV-1a over the key's UTF-8 bytes.
///
/// Fallback hash for embedders without native xxHash64. Not used by the
/// router itself; kept byte-for-byte stable for clients that negotiated it.
#[must_use]
pub fn fnv1a_hash(key: &str) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_is_deterministic() {
        assert_eq!(key_hash("user/1"), key_hash("user/1"));
        assert_ne!(key_hash("user/1"), key_hash("user/2"));
    }

    #[test]
    fn fnv1a_known_vectors() {
        // FNV-1a 64-bit reference values.
        assert_eq!(fnv1a_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_hash("a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn hashes_differ_between_algorithms() {
        // The two hash functions must never be used interchangeably.
        assert_ne!(key_hash("hello"), fnv1a_hash("hello"));
    }
}
