//! Encrypted envelope formats.
//!
//! Every ciphertext carried in an `enc` node starts with a version byte
//! followed by a MessagePack body. The node's `type` attribute tells which
//! body to expect:
//!
//! | type    | body                  | used for                             |
//! |---------|-----------------------|--------------------------------------|
//! | `pkmsg` | [`PreKeyEnvelope`]    | pairwise, session not yet confirmed  |
//! | `msg`   | [`RatchetMessage`]    | pairwise, established session        |
//! | `skmsg` | [`SenderKeyMessage`](crate::crypto::SenderKeyMessage) | group broadcast                      |
//!
//! Plaintexts are a padded [`MessagePayload`].

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{IdentityKey, RatchetMessage, SenderKeyDistribution, KEY_LENGTH};
use crate::error::{ProtocolError, Result};

/// Leading byte of every encrypted body.
pub const ENVELOPE_VERSION: u8 = 0x33;

/// Largest random padding appended to a plaintext.
pub const MAX_PADDING: u8 = 16;

/// Kind of an encrypted body, as written in the `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Session-establishing pairwise message.
    #[serde(rename = "pkmsg")]
    PreKey,
    /// Pairwise message on an established session.
    #[serde(rename = "msg")]
    Message,
    /// Group message under a sender key.
    #[serde(rename = "skmsg")]
    SenderKey,
}

impl EnvelopeKind {
    /// Attribute value for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::PreKey => "pkmsg",
            EnvelopeKind::Message => "msg",
            EnvelopeKind::SenderKey => "skmsg",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pkmsg" => Ok(EnvelopeKind::PreKey),
            "msg" => Ok(EnvelopeKind::Message),
            "skmsg" => Ok(EnvelopeKind::SenderKey),
            other => Err(ProtocolError::Deserialization(format!(
                "unknown envelope type: {other}"
            ))),
        }
    }
}

/// A typed ciphertext ready to be placed in an `enc` node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Body kind.
    pub kind: EnvelopeKind,
    /// Versioned body bytes.
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(kind: EnvelopeKind, ciphertext: Vec<u8>) -> Self {
        Self { kind, ciphertext }
    }
}

/// First message of a session, carrying what the responder needs to run
/// the agreement alongside the first ratchet message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyEnvelope {
    /// Sender registration id.
    pub registration_id: u32,
    /// One-time prekey consumed by the sender, if any.
    pub prekey_id: Option<u32>,
    /// Signed prekey used by the sender.
    pub signed_prekey_id: u32,
    /// Sender's base key.
    #[serde(with = "serde_bytes")]
    pub base_key: [u8; KEY_LENGTH],
    /// Sender identity.
    pub identity: IdentityKey,
    /// Embedded ratchet message.
    pub message: RatchetMessage,
}

/// A sender-key distribution bound to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSenderKey {
    /// Group address.
    pub group: String,
    /// Chain seed and verification key.
    pub distribution: SenderKeyDistribution,
}

/// Plaintext carried inside every envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Application content.
    #[serde(default, with = "serde_bytes")]
    pub content: Option<Vec<u8>>,
    /// Sender key the recipient should install.
    #[serde(default)]
    pub sender_key_distribution: Option<GroupSenderKey>,
}

impl MessagePayload {
    /// Payload with only application content.
    pub fn content(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: Some(content.into()),
            sender_key_distribution: None,
        }
    }

    /// Serializes and pads.
    pub fn to_padded_bytes(&self) -> Result<Vec<u8>> {
        Ok(pad(rmp_serde::to_vec(self)?))
    }

    /// Strips padding and deserializes.
    pub fn from_padded_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(unpad(bytes)?)?)
    }
}

/// Appends 1 to [`MAX_PADDING`] bytes, each equal to the pad length.
pub fn pad(mut plaintext: Vec<u8>) -> Vec<u8> {
    let len = rand::thread_rng().gen_range(1..=MAX_PADDING);
    plaintext.extend(std::iter::repeat(len).take(len as usize));
    plaintext
}

/// Removes padding added by [`pad`].
pub fn unpad(padded: &[u8]) -> Result<&[u8]> {
    let invalid = || ProtocolError::Deserialization("invalid padding".to_string());
    let &len = padded.last().ok_or_else(invalid)?;
    let len = len as usize;
    if len == 0 || len > padded.len() {
        return Err(invalid());
    }
    let (body, padding) = padded.split_at(padded.len() - len);
    if padding.iter().any(|&b| b as usize != len) {
        return Err(invalid());
    }
    Ok(body)
}

/// Prefixes [`ENVELOPE_VERSION`] to the MessagePack form of `body`.
pub fn encode_versioned<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    let mut out = vec![ENVELOPE_VERSION];
    out.extend_from_slice(&rmp_serde::to_vec(body)?);
    Ok(out)
}

/// Checks the version byte and decodes the body.
pub fn decode_versioned<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match bytes.split_first() {
        Some((&ENVELOPE_VERSION, body)) => Ok(rmp_serde::from_slice(body)?),
        Some((&version, _)) => Err(ProtocolError::Deserialization(format!(
            "unsupported envelope version {version:#04x}"
        ))),
        None => Err(ProtocolError::Deserialization("empty envelope".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_kind_strings() {
        for kind in [EnvelopeKind::PreKey, EnvelopeKind::Message, EnvelopeKind::SenderKey] {
            assert_eq!(kind.as_str().parse::<EnvelopeKind>().unwrap(), kind);
        }
        assert!("frank".parse::<EnvelopeKind>().is_err());
    }

    #[test]
    fn test_pad_unpad() {
        for _ in 0..32 {
            let padded = pad(b"body".to_vec());
            assert!(padded.len() > 4 && padded.len() <= 4 + MAX_PADDING as usize);
            assert_eq!(unpad(&padded).unwrap(), b"body");
        }
    }

    #[test]
    fn test_unpad_rejects_bad_padding() {
        assert!(unpad(&[]).is_err());
        assert!(unpad(&[1, 2, 0]).is_err());
        assert!(unpad(&[9, 9]).is_err());
        assert!(unpad(&[1, 3, 2]).is_err());
    }

    #[test]
    fn test_payload_padded_roundtrip() {
        let payload = MessagePayload::content(b"hello".to_vec());
        let decoded = MessagePayload::from_padded_bytes(&payload.to_padded_bytes().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_versioned_body() {
        let bytes = encode_versioned(&MessagePayload::default()).unwrap();
        assert_eq!(bytes[0], ENVELOPE_VERSION);
        let decoded: MessagePayload = decode_versioned(&bytes).unwrap();
        assert_eq!(decoded, MessagePayload::default());
    }

    #[test]
    fn test_versioned_rejects_unknown_version() {
        let mut bytes = encode_versioned(&MessagePayload::default()).unwrap();
        bytes[0] = 0x22;
        let err = decode_versioned::<MessagePayload>(&bytes).unwrap_err();
        assert!(err.to_string().contains("0x22"));
        assert!(decode_versioned::<MessagePayload>(&[]).is_err());
    }
}
