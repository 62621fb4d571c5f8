//! Hashing primitives.
//!
//! Transaction ids and sync chunk hashes are blake2b-256 over canonical
//! bytes.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

type Blake2b256 = Blake2b<U32>;

/// blake2b-256 of `bytes`.
pub fn blake2b256(bytes: &[u8]) -> [u8; 32] {
    Blake2b256::digest(bytes).into()
}

/// Number of leading zero bits in a 32-byte hash.
///
/// Used for the critical-transaction difficulty check.
pub fn leading_zero_bits(bytes: &[u8; 32]) -> u32 {
    let mut bits = 0u32;
    for &byte in bytes {
        if byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}
