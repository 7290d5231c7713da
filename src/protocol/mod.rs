//! WireGuard protocol implementation
//!
//! This module contains the core protocol components:
//! - Message wire formats
//! - Handshake logic (Noise IKpsk2)
//! - Transport keypairs and replay protection
//! - Established-session state

pub mod handshake;
pub mod keypair;
pub mod messages;
pub mod session;

pub use handshake::{respond, HandshakeInitiator, ResponderHandshake};
pub use keypair::{SymmetricKeypair, REJECT_AFTER_MESSAGES};
pub use messages::{HandshakeInitiation, HandshakeResponse, Message, MessageType, TransportView};
pub use session::{EstablishedSession, DEFAULT_KEEPALIVE, REJECT_AFTER_TIME};
