//! Double ratchet for pairwise device sessions.
//!
//! Every message is sealed with a fresh key from a symmetric chain. Each time
//! the peer presents a new ratchet key, both chains are re-seeded from a new
//! agreement, so compromise of one chain does not expose later messages.
//!
//! ## Out-of-order delivery
//!
//! When a message arrives ahead of the receiving chain, the keys of the
//! messages in between are derived and cached, up to [`RatchetLimits`].
//! Counters beyond the window fail with
//! [`ProtocolError::CounterOutOfWindow`]; counters already consumed fail with
//! [`ProtocolError::DuplicateCounter`].
//!
//! ## Atomicity
//!
//! [`RatchetState::decrypt`] works on a copy of the state and only commits it
//! after the ciphertext authenticated. A failed decrypt leaves the session
//! exactly as it was.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::kdf::{kdf_ck, kdf_rk, MessageKeys};
use super::keys::{IdentityKey, KeyPair, KEY_LENGTH};
use crate::error::{ProtocolError, Result};

/// Default number of message keys that may be skipped in one step.
pub const DEFAULT_MAX_SKIP: u32 = 2000;

/// Default number of skipped keys retained per session.
pub const DEFAULT_MAX_CACHED_KEYS: usize = 2000;

/// Bounds on out-of-order tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetLimits {
    /// Maximum counter gap accepted on a single receiving chain.
    pub max_skip: u32,
    /// Maximum number of cached skipped keys; oldest are evicted first.
    pub max_cached_keys: usize,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self {
            max_skip: DEFAULT_MAX_SKIP,
            max_cached_keys: DEFAULT_MAX_CACHED_KEYS,
        }
    }
}

/// Header sent in clear with every ratchet message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key.
    #[serde(with = "serde_bytes")]
    pub ratchet_key: [u8; KEY_LENGTH],
    /// Position in the sender's current chain.
    pub counter: u32,
    /// Length of the sender's previous chain.
    pub previous_counter: u32,
}

/// A message sealed by the ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Clear header, authenticated as associated data.
    pub header: RatchetHeader,
    /// AEAD output.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Serializes to MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserializes from MessagePack.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ChainState {
    key: [u8; 32],
    index: u32,
}

impl ChainState {
    fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// Derives the seed for the current index and steps the chain.
    fn step(&mut self) -> Result<[u8; 32]> {
        let (seed, next) = kdf_ck(&self.key)?;
        self.key = next;
        self.index = self.index.checked_add(1).ok_or_else(|| {
            ProtocolError::InvalidKeyMaterial("chain counter exhausted".to_string())
        })?;
        Ok(seed)
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SkippedKey {
    ratchet_key: [u8; KEY_LENGTH],
    counter: u32,
    seed: [u8; 32],
}

/// State of one pairwise session.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: [u8; 32],
    self_ratchet: KeyPair,
    remote_ratchet: Option<[u8; KEY_LENGTH]>,
    sending: Option<ChainState>,
    receiving: Option<ChainState>,
    previous_counter: u32,
    skipped: VecDeque<SkippedKey>,
    local_identity: IdentityKey,
    remote_identity: IdentityKey,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("remote_identity", &self.remote_identity.fingerprint())
            .field("sending_index", &self.sending.as_ref().map(|c| c.index))
            .field("receiving_index", &self.receiving.as_ref().map(|c| c.index))
            .field("skipped_keys", &self.skipped.len())
            .finish()
    }
}

impl RatchetState {
    /// Starts a session as the side that ran the key agreement.
    ///
    /// The peer's signed prekey acts as its first ratchet key.
    pub fn initiator(
        shared_secret: &[u8; 32],
        remote_signed_prekey: &[u8; KEY_LENGTH],
        local_identity: IdentityKey,
        remote_identity: IdentityKey,
    ) -> Result<Self> {
        let self_ratchet = KeyPair::generate();
        let dh = self_ratchet.agree(remote_signed_prekey)?;
        let (root_key, chain_key) = kdf_rk(shared_secret, &dh)?;
        Ok(Self {
            root_key,
            self_ratchet,
            remote_ratchet: Some(*remote_signed_prekey),
            sending: Some(ChainState::new(chain_key)),
            receiving: None,
            previous_counter: 0,
            skipped: VecDeque::new(),
            local_identity,
            remote_identity,
        })
    }

    /// Starts a session as the side whose prekeys were used.
    ///
    /// No sending chain exists until the first message arrives.
    pub fn responder(
        shared_secret: &[u8; 32],
        signed_prekey: KeyPair,
        local_identity: IdentityKey,
        remote_identity: IdentityKey,
    ) -> Self {
        Self {
            root_key: *shared_secret,
            self_ratchet: signed_prekey,
            remote_ratchet: None,
            sending: None,
            receiving: None,
            previous_counter: 0,
            skipped: VecDeque::new(),
            local_identity,
            remote_identity,
        }
    }

    /// Identity of the peer.
    pub fn remote_identity(&self) -> &IdentityKey {
        &self.remote_identity
    }

    /// Identity of this device.
    pub fn local_identity(&self) -> &IdentityKey {
        &self.local_identity
    }

    /// True once this side can send.
    pub fn can_send(&self) -> bool {
        self.sending.is_some()
    }

    /// True once at least one message from the peer was accepted.
    pub fn has_received(&self) -> bool {
        self.receiving.is_some()
    }

    /// Number of cached skipped keys.
    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }

    fn associated_data(
        sender: &IdentityKey,
        receiver: &IdentityKey,
        header: &RatchetHeader,
    ) -> Result<Vec<u8>> {
        let header_bytes = rmp_serde::to_vec(header)?;
        let mut aad = Vec::with_capacity(4 * KEY_LENGTH + header_bytes.len());
        aad.extend_from_slice(&sender.to_bytes());
        aad.extend_from_slice(&receiver.to_bytes());
        aad.extend_from_slice(&header_bytes);
        Ok(aad)
    }

    /// Seals `plaintext` with the next sending key.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage> {
        let ratchet_key = self.self_ratchet.public();
        let previous_counter = self.previous_counter;
        let chain = self.sending.as_mut().ok_or_else(|| {
            ProtocolError::InvalidKeyMaterial("session has no sending chain".to_string())
        })?;

        let header = RatchetHeader {
            ratchet_key,
            counter: chain.index,
            previous_counter,
        };
        let seed = chain.step()?;
        let aad = Self::associated_data(&self.local_identity, &self.remote_identity, &header)?;
        let ciphertext = MessageKeys::derive(&seed)?.seal(plaintext, &aad)?;
        Ok(RatchetMessage { header, ciphertext })
    }

    /// Opens a message, committing state changes only on success.
    pub fn decrypt(&mut self, message: &RatchetMessage, limits: &RatchetLimits) -> Result<Vec<u8>> {
        let mut working = self.clone();
        let plaintext = working.decrypt_in_place(message, limits)?;
        *self = working;
        Ok(plaintext)
    }

    fn decrypt_in_place(
        &mut self,
        message: &RatchetMessage,
        limits: &RatchetLimits,
    ) -> Result<Vec<u8>> {
        let header = &message.header;
        let aad = Self::associated_data(&self.remote_identity, &self.local_identity, header)?;

        if let Some(pos) = self
            .skipped
            .iter()
            .position(|k| k.ratchet_key == header.ratchet_key && k.counter == header.counter)
        {
            let cached = self.skipped.remove(pos).ok_or_else(|| {
                ProtocolError::InvalidKeyMaterial("skipped key vanished".to_string())
            })?;
            return MessageKeys::derive(&cached.seed)?.open(&message.ciphertext, &aad);
        }

        let same_chain = self.remote_ratchet == Some(header.ratchet_key);
        if same_chain {
            if let Some(chain) = &self.receiving {
                if header.counter < chain.index {
                    return Err(ProtocolError::DuplicateCounter {
                        counter: header.counter,
                    });
                }
            }
        } else {
            if self.receiving.is_some() {
                self.skip_until(header.previous_counter, limits)?;
            }
            self.step_ratchet(&header.ratchet_key)?;
        }

        self.skip_until(header.counter, limits)?;
        let chain = self.receiving.as_mut().ok_or_else(|| {
            ProtocolError::InvalidKeyMaterial("session has no receiving chain".to_string())
        })?;
        let seed = chain.step()?;
        MessageKeys::derive(&seed)?.open(&message.ciphertext, &aad)
    }

    fn step_ratchet(&mut self, remote_key: &[u8; KEY_LENGTH]) -> Result<()> {
        let dh = self.self_ratchet.agree(remote_key)?;
        let (root_key, receiving) = kdf_rk(&self.root_key, &dh)?;

        let next_ratchet = KeyPair::generate();
        let dh = next_ratchet.agree(remote_key)?;
        let (root_key, sending) = kdf_rk(&root_key, &dh)?;

        self.previous_counter = self.sending.as_ref().map_or(0, |c| c.index);
        self.root_key = root_key;
        self.self_ratchet = next_ratchet;
        self.remote_ratchet = Some(*remote_key);
        self.receiving = Some(ChainState::new(receiving));
        self.sending = Some(ChainState::new(sending));
        Ok(())
    }

    /// Caches keys on the receiving chain up to (not including) `until`.
    fn skip_until(&mut self, until: u32, limits: &RatchetLimits) -> Result<()> {
        let Some(remote_key) = self.remote_ratchet else {
            return Ok(());
        };
        let Some(chain) = self.receiving.as_mut() else {
            return Ok(());
        };
        if until <= chain.index {
            return Ok(());
        }
        if until - chain.index > limits.max_skip {
            return Err(ProtocolError::CounterOutOfWindow {
                counter: until,
                expected: chain.index,
                limit: limits.max_skip,
            });
        }

        while chain.index < until {
            let counter = chain.index;
            let seed = chain.step()?;
            self.skipped.push_back(SkippedKey {
                ratchet_key: remote_key,
                counter,
                seed,
            });
        }
        while self.skipped.len() > limits.max_cached_keys {
            self.skipped.pop_front();
        }
        Ok(())
    }
}
