//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Cipher errors
    /// Key is not exactly 16 bytes long.
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength {
        /// Required key length.
        expected: usize,
        /// Length that was supplied.
        got: usize,
    },

    /// PKCS7 padding (or ECB block alignment) did not verify on decrypt.
    #[error("invalid padding: {0}")]
    Padding(String),

    /// AES-GCM authentication tag did not verify.
    #[error("authentication failed: {0}")]
    Authentication(String),

    // Payload errors
    /// Payload body is not the JSON shape the command requires.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Command id is not in the command table.
    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u32),

    /// Version string or number is not a supported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Failed to serialize a payload.
    #[error("serialization failed: {0}")]
    Serialization(String),

    // Frame errors
    /// Checksum, HMAC or GCM tag of a packet did not match its contents.
    #[error("corrupt packet: {0}")]
    CorruptPacket(String),

    /// Packet prefix or suffix is wrong. Recoverable by rescanning the stream.
    #[error("framing error: expected {expected:#010x}, got {got:#010x}")]
    Framing {
        /// Expected magic value.
        expected: u32,
        /// Actual magic value received.
        got: u32,
    },

    /// Header claims a payload larger than devices ever send.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Claimed payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Not enough bytes buffered for a complete packet.
    #[error("incomplete packet: need {needed} bytes, have {have}")]
    Incomplete {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        have: usize,
    },

    // Session errors
    /// Every sequence number of the session has been used.
    #[error("sequence numbers exhausted")]
    SequenceExhausted,

    // Cloud errors
    /// A required cloud request field was not supplied.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Whether the caller can recover locally by reading or skipping bytes.
    ///
    /// Only stream-level framing problems qualify. Everything else must be
    /// surfaced to the caller, which decides whether to retry at the
    /// transport level.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Framing { .. } | ProtocolError::Incomplete { .. }
        )
    }
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::MalformedPayload(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::Padding(format!("invalid base64: {}", err))
    }
}
