//! Cryptographic primitives
//!
//! Key management, node address derivation, and hashing helpers.

pub mod hash;
pub mod keys;

pub use hash::{double_sha256, sha256, sha256_hex};
pub use keys::{
    public_key_from_slice, sign_digest, verify_signature, Address, KeyError, KeyPair,
};
