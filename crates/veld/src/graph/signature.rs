//! Structural fingerprints: FNV-1a over canonical `bincode` bytes.

use serde::Serialize;

use crate::dtype::DType;
use crate::op::Operation;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(FNV1A_OFFSET, bytes)
}

/// Hashes any serializable value through its canonical byte encoding.
pub fn hash_serializable<T: Serialize>(value: &T) -> u64 {
    let bytes = bincode::serialize(value).expect("signature key serialization failed");
    fnv1a_hash(&bytes)
}

/// Leaf signature: buffer identity only, never contents.
pub(crate) fn leaf_signature(buffer_id: u64) -> u64 {
    hash_serializable(&(0u8, buffer_id))
}

/// Interior signature: operation tag + payload, result dtype, and the
/// ordered child signatures.
pub(crate) fn expr_signature(op: &Operation, dtype: DType, child_signatures: &[u64]) -> u64 {
    hash_serializable(&(1u8, op, dtype, child_signatures))
}
