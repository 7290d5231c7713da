//! Noise_IKpsk2 handshake
//!
//! One [`HandshakeInitiator`] or [`ResponderHandshake`] exists per handshake
//! attempt and is consumed when the attempt completes. The responder side is
//! split in two phases because the preshared key is looked up by the
//! initiator's static identity, which only becomes known after the first
//! phase decrypts it:
//!
//! 1. [`respond`] mixes the initiation through the decryption of the static
//!    key and timestamp, yielding the initiator's identity.
//! 2. [`ResponderHandshake::finish`] takes the peer's PSK and produces the
//!    response message plus the transport keypair.
//!
//! Every handshake AEAD uses counter zero; each derived key encrypts exactly
//! one message.

use tai64::Tai64N;

use crate::crypto::{aead, blake2s};
use crate::error::{ProtocolError, Result};
use crate::keys::{NoisePresharedKey, NoisePrivateKey, NoisePublicKey, KEY_LEN};
use crate::protocol::keypair::SymmetricKeypair;
use crate::protocol::messages::{HandshakeInitiation, HandshakeResponse};

const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// TAI64N timestamp length in the initiation
const TIMESTAMP_LEN: usize = 12;

/// The Noise symmetric state: a chaining key absorbing DH results and a
/// transcript hash binding every field as associated data.
struct SymmetricState {
    chaining_key: [u8; blake2s::HASH_LEN],
    hash: [u8; blake2s::HASH_LEN],
}

impl SymmetricState {
    /// Initial state for a handshake addressed to `responder_static`
    fn initial(responder_static: &NoisePublicKey) -> Self {
        let chaining_key = blake2s::hash(CONSTRUCTION);
        let hash = blake2s::hash_two(&chaining_key, IDENTIFIER);
        let hash = blake2s::hash_two(&hash, responder_static.as_bytes());
        Self { chaining_key, hash }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    fn mix_key(&mut self, input: &[u8]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, input);
    }

    /// Mix `input` into the chaining key and derive a one-shot message key
    fn mix_key_and_derive(&mut self, input: &[u8]) -> [u8; KEY_LEN] {
        let (chaining_key, key) = blake2s::kdf2(&self.chaining_key, input);
        self.chaining_key = chaining_key;
        key
    }

    /// The psk2 mixing step: chaining key, transcript tweak, and message key
    fn mix_psk(&mut self, psk: &NoisePresharedKey) -> [u8; KEY_LEN] {
        let (chaining_key, tau, key) = blake2s::kdf3(&self.chaining_key, psk.as_bytes());
        self.chaining_key = chaining_key;
        self.mix_hash(&tau);
        key
    }

    fn encrypt_and_hash(&mut self, key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = aead::seal(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, key: &[u8; KEY_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = aead::open(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Final key split: (initiator-to-responder, responder-to-initiator)
    fn split(&self) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
        blake2s::kdf2(&self.chaining_key, &[])
    }
}

/// In-flight initiator state, consumed by the matching response
pub struct HandshakeInitiator {
    state: SymmetricState,
    local: NoisePrivateKey,
    ephemeral: NoisePrivateKey,
    psk: NoisePresharedKey,
    sender_index: u32,
}

impl HandshakeInitiator {
    /// Build the initiation message. The returned state must be kept to
    /// consume the response; a new attempt starts over with a fresh
    /// ephemeral.
    pub fn initiate(
        local: &NoisePrivateKey,
        remote_static: &NoisePublicKey,
        psk: &NoisePresharedKey,
        sender_index: u32,
    ) -> Result<(HandshakeInitiation, Self)> {
        let mut state = SymmetricState::initial(remote_static);
        let ephemeral = NoisePrivateKey::generate();

        state.mix_key(ephemeral.public_key().as_bytes());
        state.mix_hash(ephemeral.public_key().as_bytes());

        let key = state.mix_key_and_derive(ephemeral.dh(remote_static).as_bytes());
        let encrypted_static = state.encrypt_and_hash(&key, local.public_key().as_bytes())?;

        let key = state.mix_key_and_derive(local.dh(remote_static).as_bytes());
        let timestamp = Tai64N::now().to_bytes();
        let encrypted_timestamp = state.encrypt_and_hash(&key, &timestamp)?;

        let mut message = HandshakeInitiation {
            sender_index,
            ephemeral: *ephemeral.public_key().as_bytes(),
            encrypted_static: encrypted_static
                .try_into()
                .expect("static key ciphertext is 48 bytes"),
            encrypted_timestamp: encrypted_timestamp
                .try_into()
                .expect("timestamp ciphertext is 28 bytes"),
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        message.seal_macs(remote_static);

        Ok((
            message,
            Self {
                state,
                local: local.clone(),
                ephemeral,
                psk: psk.clone(),
                sender_index,
            },
        ))
    }

    /// The local session index chosen for this attempt
    pub fn sender_index(&self) -> u32 {
        self.sender_index
    }

    /// Consume the peer's response and derive the transport keypair.
    ///
    /// Fails unless the response was produced by the holder of the remote
    /// static key against exactly this initiation.
    pub fn consume_response(mut self, response: &HandshakeResponse) -> Result<SymmetricKeypair> {
        let remote_ephemeral = NoisePublicKey::from_bytes(response.ephemeral);

        self.state.mix_key(remote_ephemeral.as_bytes());
        self.state.mix_hash(remote_ephemeral.as_bytes());

        self.state
            .mix_key(self.ephemeral.dh(&remote_ephemeral).as_bytes());
        self.state.mix_key(self.local.dh(&remote_ephemeral).as_bytes());

        let key = self.state.mix_psk(&self.psk);
        self.state
            .decrypt_and_hash(&key, &response.encrypted_nothing)?;

        let (send_key, recv_key) = self.state.split();
        Ok(SymmetricKeypair::new(send_key, recv_key))
    }
}

/// Responder state between identifying the initiator and sending the
/// response
pub struct ResponderHandshake {
    state: SymmetricState,
    initiator_static: NoisePublicKey,
    initiator_ephemeral: NoisePublicKey,
    initiator_index: u32,
    timestamp: Tai64N,
}

/// Process an initiation far enough to learn who sent it.
///
/// Returns the initiator's static public key so the caller can look up the
/// peer (and its PSK) before [`ResponderHandshake::finish`] completes the
/// exchange. mac1 must already have been verified by the caller.
pub fn respond(
    local: &NoisePrivateKey,
    initiation: &HandshakeInitiation,
) -> Result<(NoisePublicKey, ResponderHandshake)> {
    let mut state = SymmetricState::initial(local.public_key());
    let initiator_ephemeral = NoisePublicKey::from_bytes(initiation.ephemeral);

    state.mix_key(initiator_ephemeral.as_bytes());
    state.mix_hash(initiator_ephemeral.as_bytes());

    let key = state.mix_key_and_derive(local.dh(&initiator_ephemeral).as_bytes());
    let static_bytes = state.decrypt_and_hash(&key, &initiation.encrypted_static)?;
    let static_bytes: [u8; KEY_LEN] = static_bytes
        .try_into()
        .map_err(|_| ProtocolError::MacVerificationFailed)?;
    let initiator_static = NoisePublicKey::from_bytes(static_bytes);

    let key = state.mix_key_and_derive(local.dh(&initiator_static).as_bytes());
    let timestamp_bytes = state.decrypt_and_hash(&key, &initiation.encrypted_timestamp)?;
    if timestamp_bytes.len() != TIMESTAMP_LEN {
        return Err(ProtocolError::InvalidMessageLength {
            expected: TIMESTAMP_LEN,
            got: timestamp_bytes.len(),
        }
        .into());
    }
    let timestamp =
        Tai64N::from_slice(&timestamp_bytes).map_err(|_| ProtocolError::MacVerificationFailed)?;

    Ok((
        initiator_static,
        ResponderHandshake {
            state,
            initiator_static,
            initiator_ephemeral,
            initiator_index: initiation.sender_index,
            timestamp,
        },
    ))
}

impl ResponderHandshake {
    /// The initiation's decrypted TAI64N timestamp, for monotonicity checks
    /// against replayed initiations
    pub fn timestamp(&self) -> Tai64N {
        self.timestamp
    }

    /// The initiator's chosen session index
    pub fn initiator_index(&self) -> u32 {
        self.initiator_index
    }

    /// Produce the response message and the transport keypair.
    ///
    /// `local_index` is the session index this side allocated for the new
    /// session.
    pub fn finish(
        mut self,
        psk: &NoisePresharedKey,
        local_index: u32,
    ) -> Result<(HandshakeResponse, SymmetricKeypair)> {
        let ephemeral = NoisePrivateKey::generate();

        self.state.mix_key(ephemeral.public_key().as_bytes());
        self.state.mix_hash(ephemeral.public_key().as_bytes());

        self.state
            .mix_key(ephemeral.dh(&self.initiator_ephemeral).as_bytes());
        self.state
            .mix_key(ephemeral.dh(&self.initiator_static).as_bytes());

        let key = self.state.mix_psk(psk);
        let encrypted_nothing = self.state.encrypt_and_hash(&key, &[])?;

        let mut message = HandshakeResponse {
            sender_index: local_index,
            receiver_index: self.initiator_index,
            ephemeral: *ephemeral.public_key().as_bytes(),
            encrypted_nothing: encrypted_nothing
                .try_into()
                .expect("empty-plaintext ciphertext is 16 bytes"),
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        message.seal_macs(&self.initiator_static);

        // The split is directional from the initiator's point of view:
        // our send key is its receive key.
        let (initiator_send, responder_send) = self.state.split();
        Ok((
            message,
            SymmetricKeypair::new(responder_send, initiator_send),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_handshake(
        psk_initiator: &NoisePresharedKey,
        psk_responder: &NoisePresharedKey,
    ) -> Result<(SymmetricKeypair, SymmetricKeypair)> {
        let alice = NoisePrivateKey::generate();
        let bob = NoisePrivateKey::generate();

        let (initiation, initiator) =
            HandshakeInitiator::initiate(&alice, bob.public_key(), psk_initiator, 11)?;
        initiation.verify_mac1(bob.public_key())?;

        let (who, pending) = respond(&bob, &initiation)?;
        assert_eq!(who, *alice.public_key());
        assert_eq!(pending.initiator_index(), 11);

        let (response, bob_keys) = pending.finish(psk_responder, 22)?;
        assert_eq!(response.receiver_index, 11);
        response.verify_mac1(alice.public_key())?;

        let alice_keys = initiator.consume_response(&response)?;
        Ok((alice_keys, bob_keys))
    }

    #[test]
    fn test_handshake_derives_matching_transport_keys() {
        let psk = NoisePresharedKey::zero();
        let (alice, bob) = complete_handshake(&psk, &psk).unwrap();

        let (counter, sealed) = alice.seal(b"first transport packet").unwrap();
        assert_eq!(counter, 0);
        let opened = bob.open(counter, &sealed).unwrap();
        assert_eq!(opened, b"first transport packet");

        // And the reverse direction
        let (counter, sealed) = bob.seal(b"reply").unwrap();
        assert_eq!(alice.open(counter, &sealed).unwrap(), b"reply");
    }

    #[test]
    fn test_handshake_with_preshared_key() {
        let psk = NoisePresharedKey::from_bytes([0x5A; 32]);
        let (alice, bob) = complete_handshake(&psk, &psk).unwrap();

        let (counter, sealed) = alice.seal(b"psk protected").unwrap();
        assert_eq!(bob.open(counter, &sealed).unwrap(), b"psk protected");
    }

    #[test]
    fn test_mismatched_psk_fails() {
        let good = NoisePresharedKey::zero();
        let bad = NoisePresharedKey::from_bytes([1u8; 32]);
        assert!(complete_handshake(&good, &bad).is_err());
    }

    #[test]
    fn test_initiation_to_wrong_responder_fails() {
        let alice = NoisePrivateKey::generate();
        let bob = NoisePrivateKey::generate();
        let mallory = NoisePrivateKey::generate();
        let psk = NoisePresharedKey::zero();

        let (initiation, _) =
            HandshakeInitiator::initiate(&alice, bob.public_key(), &psk, 1).unwrap();

        // Mallory cannot decrypt an initiation addressed to Bob
        assert!(respond(&mallory, &initiation).is_err());
    }

    #[test]
    fn test_tampered_initiation_rejected() {
        let alice = NoisePrivateKey::generate();
        let bob = NoisePrivateKey::generate();
        let psk = NoisePresharedKey::zero();

        let (initiation, _) =
            HandshakeInitiator::initiate(&alice, bob.public_key(), &psk, 1).unwrap();

        let mut flipped_static = initiation.clone();
        flipped_static.encrypted_static[0] ^= 1;
        assert!(respond(&bob, &flipped_static).is_err());

        let mut flipped_timestamp = initiation.clone();
        flipped_timestamp.encrypted_timestamp[0] ^= 1;
        assert!(respond(&bob, &flipped_timestamp).is_err());

        // The untouched original still decrypts
        assert!(respond(&bob, &initiation).is_ok());
    }

    #[test]
    fn test_tampered_response_rejected() {
        let alice = NoisePrivateKey::generate();
        let bob = NoisePrivateKey::generate();
        let psk = NoisePresharedKey::zero();

        let (initiation, initiator) =
            HandshakeInitiator::initiate(&alice, bob.public_key(), &psk, 1).unwrap();
        let (_, pending) = respond(&bob, &initiation).unwrap();
        let (mut response, _) = pending.finish(&psk, 2).unwrap();

        response.encrypted_nothing[0] ^= 0xFF;
        assert!(initiator.consume_response(&response).is_err());
    }

    #[test]
    fn test_timestamp_is_recent() {
        let alice = NoisePrivateKey::generate();
        let bob = NoisePrivateKey::generate();
        let psk = NoisePresharedKey::zero();

        let before = Tai64N::now();
        let (initiation, _) =
            HandshakeInitiator::initiate(&alice, bob.public_key(), &psk, 1).unwrap();
        let (_, pending) = respond(&bob, &initiation).unwrap();

        assert!(pending.timestamp() >= before);
        assert!(pending.timestamp() <= Tai64N::now());
    }
}
