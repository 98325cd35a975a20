//! Stable bucketing.
//!
//! Buckets are derived from MurmurHash3 (x86, 32-bit variant, seed 0) of `"<group_id>:<key>"`.
//! The hash is reduced modulo 10 000 and scaled to a percentage in `0.00..=99.99`. SDKs in other
//! languages that use the same input format and hash land every key in the same bucket.

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// Number of distinct buckets. Percentages have a resolution of 0.01.
pub const TOTAL_BUCKETS: u32 = 10_000;

/// MurmurHash3 x86_32.
pub fn murmur3_32(input: &[u8], seed: u32) -> u32 {
    let mut h = seed;

    let mut blocks = input.chunks_exact(4);
    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h ^= mix_k(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k |= (*byte as u32) << (8 * i);
        }
        h ^= mix_k(k);
    }

    h ^= input.len() as u32;
    fmix32(h)
}

fn mix_k(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Bucket index in `0..TOTAL_BUCKETS` for `key` salted with `group_id`.
pub fn get_bucket(group_id: &str, key: &str) -> u32 {
    let input = format!("{group_id}:{key}");
    murmur3_32(input.as_bytes(), 0) % TOTAL_BUCKETS
}

/// Stable percentage in `0.00..=99.99` for `key` salted with `group_id`.
pub fn get_percentage(group_id: &str, key: &str) -> f64 {
    get_bucket(group_id, key) as f64 / 100.0
}
