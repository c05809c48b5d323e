//! # Parley Protocol Library
//!
//! Wire codec and end-to-end cryptographic primitives for the Parley
//! multi-device messaging client.
//!
//! ## Overview
//!
//! - **Binary nodes**: a compact, dictionary-compressed encoding of the
//!   XML-like stanzas exchanged with the server
//! - **Framing**: length-prefixed frames with optional LZ4 compression
//! - **Cryptography**: identity keys, the initial key agreement, a double
//!   ratchet per device session and sender keys for groups
//! - **Envelopes**: the versioned ciphertext formats carried in `enc` nodes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Envelopes (pkmsg / msg / skmsg)     │  Ratchet + sender keys
//! ├─────────────────────────────────────────┤
//! │             Binary nodes                │  Token dictionary
//! ├─────────────────────────────────────────┤
//! │               Framing                   │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │          Transport (WebSocket)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_node, encode_node, BinaryNode, NodeCodec};
//!
//! let node = BinaryNode::new("iq")
//!     .with_attr("id", "1")
//!     .with_attr("type", "get")
//!     .with_children(vec![BinaryNode::new("ping")]);
//!
//! let bytes = encode_node(&node).unwrap();
//! assert_eq!(decode_node(&bytes).unwrap(), node);
//!
//! // Wrap in a frame for transport
//! let codec = NodeCodec::new();
//! let frame = codec.encode_frame(&node).unwrap();
//! assert!(frame.len() > bytes.len());
//! ```
//!
//! ## Modules
//!
//! - [`binary`]: Node model, token dictionary, addresses and codec
//! - [`framing`]: Frame codec with compression
//! - [`crypto`]: Keys, key agreement, ratchet and sender keys
//! - [`messages`]: Encrypted envelope formats
//! - [`error`]: Error types

pub mod binary;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;

#[cfg(test)]
mod proptests;

pub use binary::{
    decode_node, decode_node_with_depth, encode_node, encode_node_with_depth, BinaryNode,
    DeviceAddress, Jid, NodeContent, DEFAULT_MAX_DEPTH,
};
pub use crypto::{
    IdentityKey, IdentityKeyPair, KeyPair, OneTimePreKey, PreKeyBundle, PublicPreKey,
    RatchetLimits, RatchetMessage, RatchetState, SenderKeyDistribution, SenderKeyMessage,
    SenderKeyState, Signature, SignedPreKey,
};
pub use error::{ProtocolError, Result};
pub use framing::{
    Decoded, FrameCodec, FrameDecoder, FrameFlags, NodeCodec, NodeStream, COMPRESSION_THRESHOLD,
    FRAME_HEADER_SIZE, MAX_FRAME_SIZE, MAX_NODE_SIZE,
};
pub use messages::{
    EnvelopeKind, Envelope, GroupSenderKey, MessagePayload, PreKeyEnvelope, ENVELOPE_VERSION,
};
