//! Cryptographic primitives for validator keys

pub mod bls;
pub mod root;

pub use bls::{PublicKey, SecretHandle, Signature};
pub use root::Root;

/// Compare two byte strings without an early exit on the first difference
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
