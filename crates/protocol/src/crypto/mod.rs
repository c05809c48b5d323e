//! End-to-end cryptographic primitives.
//!
//! - [`keys`]: identity keys, prekeys and bundles
//! - [`kdf`]: chain derivations and the message AEAD
//! - [`x3dh`]: initial agreement between two devices
//! - [`ratchet`]: per-session double ratchet
//! - [`sender_key`]: group sender-key chains
//!
//! Everything here is synchronous and free of I/O. Session bookkeeping,
//! persistence and locking live in the client.

pub mod kdf;
pub mod keys;
pub mod ratchet;
pub mod sender_key;
pub mod x3dh;

pub use keys::{
    IdentityKey, IdentityKeyPair, KeyPair, OneTimePreKey, PreKeyBundle, PublicPreKey, Signature,
    SignedPreKey, KEY_LENGTH,
};
pub use ratchet::{RatchetHeader, RatchetLimits, RatchetMessage, RatchetState};
pub use sender_key::{SenderKeyDistribution, SenderKeyMessage, SenderKeyState};
