//! Error types for the client.
//!
//! Errors are scoped to the layer that raises them:
//!
//! - [`SessionError`]: one device session (encrypt, decrypt, bootstrap)
//! - [`QueryError`]: one request/response exchange
//! - [`StoreError`]: persistence
//! - [`TransportError`]: the byte transport
//!
//! Aggregate operations such as fan-out collect per-device errors instead
//! of failing as a whole.

use std::fmt;
use std::time::Duration;

use protocol::{DeviceAddress, ProtocolError};
use thiserror::Error;

use crate::config::ConfigError;

/// Why a connection ended.
///
/// Codes follow the server's stream error numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Closed by either side.
    ConnectionClosed,
    /// Transport failed or keepalive went unanswered.
    ConnectionLost,
    /// Another client took over this session.
    ConnectionReplaced,
    /// Credentials were revoked.
    LoggedOut,
    /// Server rejected the session state.
    BadSession,
    /// Server asked for a reconnect.
    RestartRequired,
    /// Device list out of sync with the server.
    MultideviceMismatch,
    /// Access denied.
    Forbidden,
    /// Service temporarily unavailable.
    UnavailableService,
    /// Any code not listed above.
    Unknown(u16),
}

impl DisconnectReason {
    /// Maps a numeric stream error code.
    pub fn from_code(code: u16) -> Self {
        match code {
            428 => DisconnectReason::ConnectionClosed,
            408 => DisconnectReason::ConnectionLost,
            440 => DisconnectReason::ConnectionReplaced,
            401 => DisconnectReason::LoggedOut,
            500 => DisconnectReason::BadSession,
            515 => DisconnectReason::RestartRequired,
            411 => DisconnectReason::MultideviceMismatch,
            403 => DisconnectReason::Forbidden,
            503 => DisconnectReason::UnavailableService,
            other => DisconnectReason::Unknown(other),
        }
    }

    /// Numeric code of this reason.
    pub fn code(&self) -> u16 {
        match self {
            DisconnectReason::ConnectionClosed => 428,
            DisconnectReason::ConnectionLost => 408,
            DisconnectReason::ConnectionReplaced => 440,
            DisconnectReason::LoggedOut => 401,
            DisconnectReason::BadSession => 500,
            DisconnectReason::RestartRequired => 515,
            DisconnectReason::MultideviceMismatch => 411,
            DisconnectReason::Forbidden => 403,
            DisconnectReason::UnavailableService => 503,
            DisconnectReason::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::ConnectionClosed => "connection closed",
            DisconnectReason::ConnectionLost => "connection lost",
            DisconnectReason::ConnectionReplaced => "connection replaced",
            DisconnectReason::LoggedOut => "logged out",
            DisconnectReason::BadSession => "bad session",
            DisconnectReason::RestartRequired => "restart required",
            DisconnectReason::MultideviceMismatch => "multi-device mismatch",
            DisconnectReason::Forbidden => "forbidden",
            DisconnectReason::UnavailableService => "service unavailable",
            DisconnectReason::Unknown(_) => "unknown",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store document could not be encoded or parsed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,

    /// Required data is absent.
    #[error("store is missing {0}")]
    Missing(&'static str),
}

/// Failures of one device session.
///
/// Every variant except [`SessionError::Store`] names the device concerned.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session exists and none could be established.
    #[error("no session with {0}")]
    NoSession(DeviceAddress),

    /// No sender key is known for this group sender.
    #[error("no sender key from {address} in {group}")]
    NoSenderKey {
        /// Sending device.
        address: DeviceAddress,
        /// Group address.
        group: String,
    },

    /// The message counter lies outside the tolerance window.
    ///
    /// Requires a session reset negotiated at a higher layer.
    #[error("session with {address} is out of sync: {reason}")]
    SessionDesync {
        /// Remote device.
        address: DeviceAddress,
        /// Detail from the ratchet.
        reason: String,
    },

    /// The message was already decrypted once.
    #[error("duplicate message from {address} (counter {counter})")]
    DuplicateMessage {
        /// Remote device.
        address: DeviceAddress,
        /// Counter carried by the message.
        counter: u32,
    },

    /// Authentication failed. The session is unchanged.
    #[error("failed to decrypt message from {address}: {reason}")]
    DecryptionFailure {
        /// Remote device.
        address: DeviceAddress,
        /// Detail from the cipher.
        reason: String,
    },

    /// Local encryption failed.
    #[error("failed to encrypt message for {address}: {reason}")]
    EncryptionFailure {
        /// Remote device.
        address: DeviceAddress,
        /// Detail from the cipher.
        reason: String,
    },

    /// The bundle lookup failed or returned an unusable bundle.
    #[error("no usable prekey bundle for {address}: {reason}")]
    BundleUnavailable {
        /// Remote device.
        address: DeviceAddress,
        /// Detail from the lookup.
        reason: String,
    },

    /// A bundle was presented a second time.
    #[error("prekey bundle for {0} was already consumed")]
    BundleReused(DeviceAddress),

    /// A bootstrap envelope referenced a prekey we do not hold.
    #[error("{address} referenced unknown prekey {prekey_id}")]
    InvalidPreKey {
        /// Remote device.
        address: DeviceAddress,
        /// Referenced prekey id.
        prekey_id: u32,
    },

    /// The envelope could not be parsed.
    #[error("malformed envelope from {address}: {reason}")]
    MalformedEnvelope {
        /// Remote device.
        address: DeviceAddress,
        /// Parse failure detail.
        reason: String,
    },

    /// Persistence failed.
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Classifies a primitive failure for `address`.
    pub fn from_protocol(address: &DeviceAddress, err: ProtocolError) -> Self {
        let address = address.clone();
        match err {
            ProtocolError::CounterOutOfWindow { .. } => SessionError::SessionDesync {
                address,
                reason: err.to_string(),
            },
            ProtocolError::DuplicateCounter { counter } => {
                SessionError::DuplicateMessage { address, counter }
            }
            ProtocolError::Decryption(_)
            | ProtocolError::InvalidSignature(_)
            | ProtocolError::InvalidPublicKey(_)
            | ProtocolError::InvalidKeyMaterial(_) => SessionError::DecryptionFailure {
                address,
                reason: err.to_string(),
            },
            ProtocolError::Encryption(_) => SessionError::EncryptionFailure {
                address,
                reason: err.to_string(),
            },
            ProtocolError::Serialization(_)
            | ProtocolError::Deserialization(_)
            | ProtocolError::MalformedNode(_)
            | ProtocolError::FrameTooLarge { .. } => SessionError::MalformedEnvelope {
                address,
                reason: err.to_string(),
            },
        }
    }

    /// Device the error concerns, if any.
    pub fn address(&self) -> Option<&DeviceAddress> {
        match self {
            SessionError::NoSession(address)
            | SessionError::BundleReused(address)
            | SessionError::NoSenderKey { address, .. }
            | SessionError::SessionDesync { address, .. }
            | SessionError::DuplicateMessage { address, .. }
            | SessionError::DecryptionFailure { address, .. }
            | SessionError::EncryptionFailure { address, .. }
            | SessionError::BundleUnavailable { address, .. }
            | SessionError::InvalidPreKey { address, .. }
            | SessionError::MalformedEnvelope { address, .. } => Some(address),
            SessionError::Store(_) => None,
        }
    }

    /// True if retrying with a corrected payload may succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SessionError::SessionDesync { .. } | SessionError::Store(_)
        )
    }
}

/// Failures of the byte transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is closed.
    #[error("transport closed")]
    Closed,

    /// Connecting did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Failures of one query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// No response arrived in time. The pending slot has been released.
    #[error("query {tag} timed out after {timeout:?}")]
    Timeout {
        /// Correlation tag.
        tag: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The connection ended before a response arrived.
    #[error("connection closed: {0}")]
    ConnectionClosed(DisconnectReason),

    /// The server answered with an error.
    #[error("server error {code}: {text}")]
    Server {
        /// Error code.
        code: u16,
        /// Error text.
        text: String,
    },

    /// The transport rejected the outbound frame.
    #[error("failed to send: {0}")]
    Send(String),

    /// The outbound node could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// A query with this tag is already pending.
    #[error("tag {0} is already pending")]
    DuplicateTag(String),
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Codec or cryptographic primitive failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Session failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Query failure.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using the top-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_codes_roundtrip() {
        for code in [428, 408, 440, 401, 500, 515, 411, 403, 503, 999] {
            assert_eq!(DisconnectReason::from_code(code).code(), code);
        }
        assert_eq!(
            DisconnectReason::from_code(999),
            DisconnectReason::Unknown(999)
        );
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(
            DisconnectReason::ConnectionReplaced.to_string(),
            "connection replaced (440)"
        );
    }

    #[test]
    fn test_session_error_display() {
        let address = DeviceAddress::new("15551234567", 2);
        assert_eq!(
            SessionError::NoSession(address.clone()).to_string(),
            "no session with 15551234567.2"
        );
        assert_eq!(
            SessionError::InvalidPreKey {
                address,
                prekey_id: 7
            }
            .to_string(),
            "15551234567.2 referenced unknown prekey 7"
        );
    }

    #[test]
    fn test_protocol_error_classification() {
        let address = DeviceAddress::new("a", 1);
        let desync = SessionError::from_protocol(
            &address,
            ProtocolError::CounterOutOfWindow {
                counter: 5000,
                expected: 1,
                limit: 2000,
            },
        );
        assert!(matches!(desync, SessionError::SessionDesync { .. }));
        assert!(!desync.is_recoverable());

        let failure =
            SessionError::from_protocol(&address, ProtocolError::Decryption("tag".into()));
        assert!(matches!(failure, SessionError::DecryptionFailure { .. }));
        assert!(failure.is_recoverable());
        assert_eq!(failure.address(), Some(&address));

        let duplicate =
            SessionError::from_protocol(&address, ProtocolError::DuplicateCounter { counter: 3 });
        assert!(matches!(
            duplicate,
            SessionError::DuplicateMessage { counter: 3, .. }
        ));
    }

    #[test]
    fn test_query_error_display() {
        let err = QueryError::Timeout {
            tag: "1.2-3".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "query 1.2-3 timed out after 5s");
        assert_eq!(
            QueryError::ConnectionClosed(DisconnectReason::ConnectionLost).to_string(),
            "connection closed: connection lost (408)"
        );
    }
}
