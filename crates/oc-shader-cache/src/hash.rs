//! Content hashing
//!
//! These hashes only pick buckets. Every hit is confirmed with a full byte
//! comparison, so none of them need to be collision resistant.

use xxhash_rust::xxh64::xxh64;

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a, used for the in-memory program indexes
pub fn fnv1a_32(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(FNV_PRIME)
    })
}

/// Dedup key of a guest code entry, covering both the code and its
/// constant buffer 1 snapshot
pub fn guest_code_hash(code: &[u8], cb1_data: &[u8]) -> u32 {
    let hash = xxh64(cb1_data, xxh64(code, 0));
    (hash ^ (hash >> 32)) as u32
}
