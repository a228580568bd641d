//! sdwan Error Types

use thiserror::Error;

/// Result type alias for sdwan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Envelope framing and payload errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame too short: {len} bytes (header is {min})")]
    FrameTooShort { len: usize, min: usize },

    #[error("Length mismatch: header declares {declared} bytes, frame carries {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(#[source] CryptoError),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(#[source] CryptoError),

    #[error("Encrypted envelope received but encryption is not configured")]
    EncryptionNotConfigured,

    #[error("Plaintext envelope rejected: encryption is required")]
    PlaintextRejected,

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

/// Transport security errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Ciphertext too short: {len} bytes (nonce is {nonce})")]
    CiphertextTooShort { len: usize, nonce: usize },

    #[error("Authentication failed (wrong key or corrupted data)")]
    AuthenticationFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid key size {0} (expected 16..=64 bytes)")]
    InvalidKeySize(usize),
}

/// Peer directory errors. Logged by callers, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Invalid route metric {0} (255 means no route)")]
    InvalidMetric(u8),
}

/// Relay connection manager errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay session to {0} already exists")]
    AlreadyConnected(String),

    #[error("No relay session to {0}")]
    NoSuchConnection(String),

    #[error("Relay {relay} did not acknowledge session to {target} in time")]
    RelayTimeout { target: String, relay: String },

    #[error("Failed to send to relay: {0}")]
    RelaySendError(#[source] std::io::Error),

    #[error("Timed out waiting for relayed data from {0}")]
    Timeout(String),

    #[error("Relay rejected session to {target}: {reply}")]
    Rejected { target: String, reply: String },

    #[error("Malformed relay frame ({0} bytes)")]
    MalformedFrame(usize),

    #[error("Relay I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// sdwan error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    // Core subsystem errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Device errors
    #[error("TUN device error: {0}")]
    Device(String),

    // Transport (socket) errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Relay(RelayError::RelayTimeout { .. })
                | Error::Relay(RelayError::Timeout(_))
                | Error::Relay(RelayError::RelaySendError(_))
                | Error::Io(_)
                | Error::Timeout(_)
        )
    }

    /// Check if this error concerns a single datagram only, so the
    /// receive loop should log it and move on
    pub fn is_per_datagram(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Serialization(_) | Error::Directory(_)
        )
    }
}
