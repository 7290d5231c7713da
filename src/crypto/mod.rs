//! Cryptographic capability wrappers
//!
//! Thin, stateless wrappers over the primitive crates:
//! - BLAKE2s hashing, keyed MAC, and the HKDF-style chain expansion (blake2s)
//! - ChaCha20-Poly1305 AEAD with WireGuard's counter nonce (aead)
//!
//! X25519 lives with the key types in [`crate::keys`].

pub mod aead;
pub mod blake2s;
