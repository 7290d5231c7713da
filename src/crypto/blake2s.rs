//! BLAKE2s hashing, MAC, and chain key derivation
//!
//! The WireGuard handshake derives every key from a 32-byte chaining key via
//! the HKDF construction instantiated with HMAC-BLAKE2s. Despite the
//! whitepaper's notation, implementations (boringtun, wireguard-go) use the
//! standard RFC 2104 HMAC, which is what we do here.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

type HmacBlake2s = SimpleHmac<Blake2s256>;

/// BLAKE2s-256 output length (also the chaining key length)
pub const HASH_LEN: usize = 32;

/// Keyed MAC output length (mac1 field)
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 over one input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut h = Blake2s256::new();
    Digest::update(&mut h, data);
    h.finalize().into()
}

/// BLAKE2s-256 over two concatenated inputs: HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut h = Blake2s256::new();
    Digest::update(&mut h, a);
    Digest::update(&mut h, b);
    h.finalize().into()
}

/// 16-byte keyed BLAKE2s MAC with a 32-byte key (mac1)
pub fn mac(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut m = Blake2sMac::<U16>::new_from_slice(key).expect("32 is a valid BLAKE2s key length");
    MacTrait::update(&mut m, data);
    m.finalize_fixed().into()
}

/// RFC 2104 HMAC-BLAKE2s
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut m = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut m, data);
    m.finalize_fixed().into()
}

/// HKDF expansion step: T(n) = HMAC(prk, T(n-1) || n)
fn expand(prk: &[u8; HASH_LEN], previous: &[u8], n: u8) -> [u8; HASH_LEN] {
    let mut input = [0u8; HASH_LEN + 1];
    input[..previous.len()].copy_from_slice(previous);
    input[previous.len()] = n;
    hmac(prk, &input[..previous.len() + 1])
}

/// One-output KDF: updates the chaining key only
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let prk = hmac(key, input);
    expand(&prk, &[], 1)
}

/// Two-output KDF: (new chaining key, derived key)
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = hmac(key, input);
    let t1 = expand(&prk, &[], 1);
    let t2 = expand(&prk, &t1, 2);
    (t1, t2)
}

/// Three-output KDF: used for the PSK mixing step
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = hmac(key, input);
    let t1 = expand(&prk, &[], 1);
    let t2 = expand(&prk, &t1, 2);
    let t3 = expand(&prk, &t2, 3);
    (t1, t2, t3)
}
