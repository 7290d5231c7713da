//! Error types for DriftVPN

use thiserror::Error;

/// Main error type for DriftVPN
#[derive(Error, Debug)]
pub enum DriftVpnError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Buffer pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
///
/// `Decryption` is an authentication failure: the ciphertext was tampered
/// with, corrupted, or produced under a different key. The offending message
/// is dropped and never retried.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Handshake timed out after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },

    #[error("Peer {fingerprint} unreachable")]
    PeerUnreachable { fingerprint: String },

    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("Replay attack detected: counter {counter} already seen")]
    ReplayDetected { counter: u64 },

    #[error("Session expired")]
    SessionExpired,

    #[error("No active session")]
    NoSession,

    #[error("Unknown receiver index: {index}")]
    UnknownReceiverIndex { index: u32 },

    #[error("No peer registered for public key {fingerprint}")]
    UnknownPeer { fingerprint: String },

    #[error("Peer {fingerprint} already registered")]
    DuplicatePeer { fingerprint: String },
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Transport channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to create TUN device: {reason}")]
    CreateFailed { reason: String },

    #[error("TUN read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },
}

/// Packet buffer pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Packet handle already released")]
    AlreadyReleased,

    #[error("Data too large for pooled buffer: {requested} > {capacity}")]
    Oversize { requested: usize, capacity: usize },
}

/// Result type alias for DriftVPN operations
pub type Result<T> = std::result::Result<T, DriftVpnError>;
