//! WireGuard message wire formats
//!
//! All multi-byte integers are little-endian. Every datagram is decoded
//! through [`parse`], which validates the leading type byte and the length
//! before any field is interpreted:
//!
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 4: Transport Data (16-byte header + ciphertext)
//!
//! Type 3 (cookie reply) is recognized and dropped; the cookie/mac2 DoS
//! mitigation path is not implemented and mac2 fields are always zero.

use crate::crypto::blake2s;
use crate::error::ProtocolError;
use crate::keys::NoisePublicKey;

/// Label mixed into the mac1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// WireGuard message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

/// A parsed datagram. Transport payloads borrow the receive buffer.
#[derive(Debug)]
pub enum Message<'a> {
    Initiation(HandshakeInitiation),
    Response(HandshakeResponse),
    CookieReply,
    Transport(TransportView<'a>),
}

/// Decode a datagram, validating the type tag before anything else
pub fn parse(datagram: &[u8]) -> Result<Message<'_>, ProtocolError> {
    let &tag = datagram.first().ok_or(ProtocolError::InvalidMessageLength {
        expected: 1,
        got: 0,
    })?;

    match tag {
        1 => Ok(Message::Initiation(HandshakeInitiation::from_bytes(
            datagram,
        )?)),
        2 => Ok(Message::Response(HandshakeResponse::from_bytes(datagram)?)),
        3 => Ok(Message::CookieReply),
        4 => Ok(Message::Transport(TransportView::from_bytes(datagram)?)),
        msg_type => Err(ProtocolError::InvalidMessageType { msg_type }),
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().expect("bounds checked"))
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    data[at..at + N].try_into().expect("bounds checked")
}

fn check_len(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() != expected {
        return Err(ProtocolError::InvalidMessageLength {
            expected,
            got: data.len(),
        });
    }
    Ok(())
}

/// Handshake Initiation (148 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | ephemeral(32) |
/// encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral: [u8; 32],
    pub encrypted_static: [u8; 48],
    pub encrypted_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;
    const MAC1_OFFSET: usize = 116;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeInitiation as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len(data, Self::SIZE)?;

        Ok(Self {
            sender_index: read_u32(data, 4),
            ephemeral: read_array(data, 8),
            encrypted_static: read_array(data, 40),
            encrypted_timestamp: read_array(data, 88),
            mac1: read_array(data, 116),
            mac2: read_array(data, 132),
        })
    }

    /// Fill in mac1 (keyed by the responder's static key) over all preceding
    /// bytes. mac2 stays zero.
    pub fn seal_macs(&mut self, responder_static: &NoisePublicKey) {
        let bytes = self.to_bytes();
        self.mac1 = compute_mac1(responder_static, &bytes[..Self::MAC1_OFFSET]);
    }

    /// Check mac1 against our own static key (we are the responder)
    pub fn verify_mac1(&self, our_static: &NoisePublicKey) -> Result<(), ProtocolError> {
        let bytes = self.to_bytes();
        let expected = compute_mac1(our_static, &bytes[..Self::MAC1_OFFSET]);
        if self.mac1 != expected {
            return Err(ProtocolError::MacVerificationFailed);
        }
        Ok(())
    }
}

/// Handshake Response (92 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | receiver_index(4) |
/// ephemeral(32) | encrypted_nothing(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;
    const MAC1_OFFSET: usize = 60;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeResponse as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len(data, Self::SIZE)?;

        Ok(Self {
            sender_index: read_u32(data, 4),
            receiver_index: read_u32(data, 8),
            ephemeral: read_array(data, 12),
            encrypted_nothing: read_array(data, 44),
            mac1: read_array(data, 60),
            mac2: read_array(data, 76),
        })
    }

    /// Fill in mac1 (keyed by the initiator's static key)
    pub fn seal_macs(&mut self, initiator_static: &NoisePublicKey) {
        let bytes = self.to_bytes();
        self.mac1 = compute_mac1(initiator_static, &bytes[..Self::MAC1_OFFSET]);
    }

    /// Check mac1 against our own static key (we are the initiator)
    pub fn verify_mac1(&self, our_static: &NoisePublicKey) -> Result<(), ProtocolError> {
        let bytes = self.to_bytes();
        let expected = compute_mac1(our_static, &bytes[..Self::MAC1_OFFSET]);
        if self.mac1 != expected {
            return Err(ProtocolError::MacVerificationFailed);
        }
        Ok(())
    }
}

/// mac1 = MAC(HASH("mac1----" || receiver_static), preceding bytes)
fn compute_mac1(receiver_static: &NoisePublicKey, preceding: &[u8]) -> [u8; 16] {
    let key = blake2s::hash_two(LABEL_MAC1, receiver_static.as_bytes());
    blake2s::mac(&key, preceding)
}

/// Transport Data header (16 bytes) followed by the AEAD ciphertext
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | counter(8) | ciphertext(n+16)
/// ```
///
/// A ciphertext of exactly the tag length (zero-length plaintext) is a
/// keepalive.
#[derive(Debug)]
pub struct TransportView<'a> {
    pub receiver_index: u32,
    pub counter: u64,
    pub ciphertext: &'a [u8],
}

/// Transport header size
pub const TRANSPORT_HEADER: usize = 16;

/// Smallest valid transport message (header plus bare tag)
pub const TRANSPORT_MIN: usize = TRANSPORT_HEADER + 16;

impl<'a> TransportView<'a> {
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, ProtocolError> {
        if data.len() < TRANSPORT_MIN {
            return Err(ProtocolError::InvalidMessageLength {
                expected: TRANSPORT_MIN,
                got: data.len(),
            });
        }

        Ok(Self {
            receiver_index: read_u32(data, 4),
            counter: u64::from_le_bytes(data[8..16].try_into().expect("bounds checked")),
            ciphertext: &data[TRANSPORT_HEADER..],
        })
    }
}

/// Assemble a transport message into `out`
pub fn encode_transport(
    out: &mut crate::pool::PacketBuf,
    receiver_index: u32,
    counter: u64,
    ciphertext: &[u8],
) -> Result<(), crate::error::PoolError> {
    out.clear();
    out.extend_from_slice(&[MessageType::TransportData as u8, 0, 0, 0])?;
    out.extend_from_slice(&receiver_index.to_le_bytes())?;
    out.extend_from_slice(&counter.to_le_bytes())?;
    out.extend_from_slice(ciphertext)
}
