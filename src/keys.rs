//! Noise key material
//!
//! Fixed 32-byte key types used by the handshake: the local static identity,
//! remote static public keys, and the optional preshared key. Private key
//! material is wiped on drop; public keys compare and hash byte-wise.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of all Noise keys
pub const KEY_LEN: usize = 32;

/// Error returned when a base64 key string cannot be decoded
#[derive(Error, Debug)]
#[error("invalid base64-encoded 32-byte key")]
pub struct InvalidKeyError;

/// An X25519 private key that owns its derived public key.
///
/// The public key is computed once at construction and cached. Used both for
/// the static identity (long-lived, from configuration) and for handshake
/// ephemerals (discarded after one handshake attempt).
#[derive(Clone)]
pub struct NoisePrivateKey {
    secret: StaticSecret,
    public: NoisePublicKey,
}

impl NoisePrivateKey {
    /// Generate a fresh key from the OS RNG
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = NoisePublicKey(PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// The cached public half of this key
    pub fn public_key(&self) -> &NoisePublicKey {
        &self.public
    }

    /// X25519 Diffie-Hellman with a remote public key.
    ///
    /// The returned shared secret is wiped on drop.
    pub fn dh(&self, remote: &NoisePublicKey) -> SharedSecret {
        self.secret.diffie_hellman(&PublicKey::from(remote.0))
    }
}

impl fmt::Debug for NoisePrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print private key material
        write!(f, "NoisePrivateKey(pub {})", self.public.fingerprint())
    }
}

impl FromStr for NoisePrivateKey {
    type Err = InvalidKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(decode_key(s)?))
    }
}

/// An X25519 public key. Byte-wise equality and hashing.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoisePublicKey(pub(crate) [u8; KEY_LEN]);

impl NoisePublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short hex prefix for log correlation
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NoisePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64.encode(self.0))
    }
}

impl fmt::Debug for NoisePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NoisePublicKey({})", self.fingerprint())
    }
}

impl FromStr for NoisePublicKey {
    type Err = InvalidKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_key(s)?))
    }
}

/// An optional 32-byte preshared key mixed into the handshake.
///
/// All zeros when unset; wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NoisePresharedKey([u8; KEY_LEN]);

impl NoisePresharedKey {
    /// The all-zero key used when no PSK is configured
    pub fn zero() -> Self {
        Self([0u8; KEY_LEN])
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Default for NoisePresharedKey {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for NoisePresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoisePresharedKey(..)")
    }
}

impl FromStr for NoisePresharedKey {
    type Err = InvalidKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_key(s)?))
    }
}

fn decode_key(s: &str) -> Result<[u8; KEY_LEN], InvalidKeyError> {
    let decoded = BASE64.decode(s.trim()).map_err(|_| InvalidKeyError)?;
    decoded.try_into().map_err(|_| InvalidKeyError)
}
