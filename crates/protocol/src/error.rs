//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering codec, framing and cryptographic failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Codec errors
    /// A binary node could not be parsed or produced.
    ///
    /// Raised for truncated input, invalid dictionary indices and
    /// inconsistent length prefixes. The offending frame should be dropped.
    #[error("malformed node: {0}")]
    MalformedNode(String),

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Authentication of a ciphertext failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Key material is missing or unusable for the requested operation.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    // Ratchet errors
    /// A message counter lies further ahead than the skip window allows.
    #[error("counter {counter} is outside the tolerance window (expected {expected}, limit {limit})")]
    CounterOutOfWindow {
        /// Counter carried by the message.
        counter: u32,
        /// Next counter the receiving chain expects.
        expected: u32,
        /// Maximum number of keys that may be skipped.
        limit: u32,
    },

    /// A message counter was already consumed and no cached key remains.
    #[error("counter {counter} was already consumed")]
    DuplicateCounter {
        /// Counter carried by the message.
        counter: u32,
    },
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::MalformedNode`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedNode(reason.into())
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_shorthand() {
        let err = ProtocolError::malformed("unexpected end of input");
        assert!(matches!(err, ProtocolError::MalformedNode(_)));
        assert_eq!(err.to_string(), "malformed node: unexpected end of input");
    }

    #[test]
    fn test_ratchet_errors_name_the_counter() {
        let window = ProtocolError::CounterOutOfWindow {
            counter: 5000,
            expected: 3,
            limit: 2000,
        };
        assert_eq!(
            window.to_string(),
            "counter 5000 is outside the tolerance window (expected 3, limit 2000)"
        );
        let duplicate = ProtocolError::DuplicateCounter { counter: 7 };
        assert_eq!(duplicate.to_string(), "counter 7 was already consumed");
    }

    #[test]
    fn test_oversized_frame_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 1 << 24,
            max: (1 << 24) - 1,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 16777216 bytes exceeds maximum of 16777215 bytes"
        );
    }

    #[test]
    fn test_truncated_envelope_is_deserialization_error() {
        // A map header promising one entry, then nothing.
        let err: ProtocolError = rmp_serde::from_slice::<std::collections::BTreeMap<u8, u8>>(&[0x81])
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_json_node_errors_classified() {
        let syntax: ProtocolError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert!(matches!(syntax, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_bad_signature_bytes_map_to_invalid_signature() {
        let err: ProtocolError = ed25519_dalek::SignatureError::new().into();
        assert!(matches!(err, ProtocolError::InvalidSignature(_)));
    }

    #[test]
    fn test_error_crosses_threads() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<ProtocolError>();
    }
}
