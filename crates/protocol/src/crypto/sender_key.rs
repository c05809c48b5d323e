//! Sender keys for group messages.
//!
//! A sender encrypts a group message once with its own symmetric chain and
//! signs the result. The chain seed and verification key are handed to each
//! member device through the pairwise sessions as a
//! [`SenderKeyDistribution`]. Members then decrypt every message from that
//! sender without further agreement.

use std::collections::VecDeque;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::kdf::{kdf_ck, MessageKeys};
use super::keys::{sign_with, verify_with, Signature, KEY_LENGTH};
use super::ratchet::RatchetLimits;
use crate::error::{ProtocolError, Result};

/// Chain seed and verification key handed to group members.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SenderKeyDistribution {
    /// Identifier of the sender key.
    pub key_id: u32,
    /// Iteration the chain key corresponds to.
    pub iteration: u32,
    /// Chain key at `iteration`.
    #[serde(with = "serde_bytes")]
    pub chain_key: [u8; 32],
    /// Ed25519 key that signs the sender's group messages.
    #[serde(with = "serde_bytes")]
    pub signing_key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for SenderKeyDistribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKeyDistribution")
            .field("key_id", &self.key_id)
            .field("iteration", &self.iteration)
            .field("chain_key", &"[REDACTED]")
            .finish()
    }
}

/// One signed group ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyMessage {
    /// Sender key the message was produced with.
    pub key_id: u32,
    /// Chain iteration.
    pub iteration: u32,
    /// AEAD output.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// Signature over the fields above.
    pub signature: Signature,
}

impl SenderKeyMessage {
    fn signed_bytes(key_id: u32, iteration: u32, ciphertext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + ciphertext.len());
        out.extend_from_slice(&key_id.to_be_bytes());
        out.extend_from_slice(&iteration.to_be_bytes());
        out.extend_from_slice(ciphertext);
        out
    }

    /// Serializes to MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserializes from MessagePack.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

fn associated_data(key_id: u32, iteration: u32) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&key_id.to_be_bytes());
    aad[4..].copy_from_slice(&iteration.to_be_bytes());
    aad
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SkippedSeed {
    iteration: u32,
    seed: [u8; 32],
}

/// Sender key chain, either our own (with signing secret) or a member's.
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    key_id: u32,
    chain_key: [u8; 32],
    iteration: u32,
    signing_public: [u8; KEY_LENGTH],
    signing_secret: Option<[u8; KEY_LENGTH]>,
    skipped: VecDeque<SkippedSeed>,
}

impl Drop for SenderKeyState {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        if let Some(secret) = self.signing_secret.as_mut() {
            secret.zeroize();
        }
    }
}

impl std::fmt::Debug for SenderKeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKeyState")
            .field("key_id", &self.key_id)
            .field("iteration", &self.iteration)
            .field("owned", &self.signing_secret.is_some())
            .finish()
    }
}

impl SenderKeyState {
    /// Creates a fresh sender key for our own group messages.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let mut chain_key = [0u8; 32];
        OsRng.fill_bytes(&mut chain_key);
        Self {
            key_id: OsRng.gen(),
            chain_key,
            iteration: 0,
            signing_public: signing.verifying_key().to_bytes(),
            signing_secret: Some(signing.to_bytes()),
            skipped: VecDeque::new(),
        }
    }

    /// Builds a receiving chain from a member's distribution.
    pub fn from_distribution(distribution: &SenderKeyDistribution) -> Self {
        Self {
            key_id: distribution.key_id,
            chain_key: distribution.chain_key,
            iteration: distribution.iteration,
            signing_public: distribution.signing_key,
            signing_secret: None,
            skipped: VecDeque::new(),
        }
    }

    /// Distribution describing the current chain position.
    pub fn distribution(&self) -> SenderKeyDistribution {
        SenderKeyDistribution {
            key_id: self.key_id,
            iteration: self.iteration,
            chain_key: self.chain_key,
            signing_key: self.signing_public,
        }
    }

    /// Identifier of this sender key.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Next iteration to be used.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    fn step(&mut self) -> Result<[u8; 32]> {
        let (seed, next) = kdf_ck(&self.chain_key)?;
        self.chain_key = next;
        self.iteration = self.iteration.checked_add(1).ok_or_else(|| {
            ProtocolError::InvalidKeyMaterial("sender key iteration exhausted".to_string())
        })?;
        Ok(seed)
    }

    /// Encrypts and signs a group message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SenderKeyMessage> {
        let secret = self.signing_secret.ok_or_else(|| {
            ProtocolError::InvalidKeyMaterial("sender key has no signing secret".to_string())
        })?;
        let key_id = self.key_id;
        let iteration = self.iteration;
        let seed = self.step()?;
        let ciphertext =
            MessageKeys::derive(&seed)?.seal(plaintext, &associated_data(key_id, iteration))?;
        let signature = sign_with(
            &secret,
            &SenderKeyMessage::signed_bytes(key_id, iteration, &ciphertext),
        );
        Ok(SenderKeyMessage {
            key_id,
            iteration,
            ciphertext,
            signature,
        })
    }

    /// Verifies and decrypts a member's message.
    ///
    /// State changes are committed only when the message authenticates.
    pub fn decrypt(&mut self, message: &SenderKeyMessage, limits: &RatchetLimits) -> Result<Vec<u8>> {
        if message.key_id != self.key_id {
            return Err(ProtocolError::InvalidKeyMaterial(format!(
                "unknown sender key {}",
                message.key_id
            )));
        }
        verify_with(
            &self.signing_public,
            &SenderKeyMessage::signed_bytes(message.key_id, message.iteration, &message.ciphertext),
            &message.signature,
        )?;

        let mut working = self.clone();
        let seed = working.seed_for(message.iteration, limits)?;
        let plaintext = MessageKeys::derive(&seed)?.open(
            &message.ciphertext,
            &associated_data(message.key_id, message.iteration),
        )?;
        *self = working;
        Ok(plaintext)
    }

    fn seed_for(&mut self, iteration: u32, limits: &RatchetLimits) -> Result<[u8; 32]> {
        if iteration < self.iteration {
            let pos = self
                .skipped
                .iter()
                .position(|s| s.iteration == iteration)
                .ok_or(ProtocolError::DuplicateCounter { counter: iteration })?;
            let cached = self.skipped.remove(pos).ok_or_else(|| {
                ProtocolError::InvalidKeyMaterial("skipped key vanished".to_string())
            })?;
            return Ok(cached.seed);
        }
        if iteration - self.iteration > limits.max_skip {
            return Err(ProtocolError::CounterOutOfWindow {
                counter: iteration,
                expected: self.iteration,
                limit: limits.max_skip,
            });
        }
        while self.iteration < iteration {
            let skipped_iteration = self.iteration;
            let seed = self.step()?;
            self.skipped.push_back(SkippedSeed {
                iteration: skipped_iteration,
                seed,
            });
        }
        while self.skipped.len() > limits.max_cached_keys {
            self.skipped.pop_front();
        }
        self.step()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender_and_member() -> (SenderKeyState, SenderKeyState) {
        let sender = SenderKeyState::generate();
        let member = SenderKeyState::from_distribution(&sender.distribution());
        (sender, member)
    }

    #[test]
    fn test_group_encrypt_decrypt() {
        let (mut sender, mut member) = sender_and_member();
        let msg = sender.encrypt(b"hello group").unwrap();
        assert_eq!(
            member.decrypt(&msg, &RatchetLimits::default()).unwrap(),
            b"hello group"
        );
    }

    #[test]
    fn test_member_cannot_encrypt() {
        let (_, mut member) = sender_and_member();
        assert!(member.encrypt(b"nope").is_err());
    }

    #[test]
    fn test_out_of_order_group_messages() {
        let limits = RatchetLimits::default();
        let (mut sender, mut member) = sender_and_member();
        let first = sender.encrypt(b"1").unwrap();
        let second = sender.encrypt(b"2").unwrap();
        assert_eq!(member.decrypt(&second, &limits).unwrap(), b"2");
        assert_eq!(member.decrypt(&first, &limits).unwrap(), b"1");
        assert!(matches!(
            member.decrypt(&first, &limits),
            Err(ProtocolError::DuplicateCounter { counter: 0 })
        ));
    }

    #[test]
    fn test_late_joiner_starts_at_current_iteration() {
        let limits = RatchetLimits::default();
        let mut sender = SenderKeyState::generate();
        let _ = sender.encrypt(b"before").unwrap();
        let mut member = SenderKeyState::from_distribution(&sender.distribution());
        assert_eq!(member.iteration(), 1);
        let msg = sender.encrypt(b"after").unwrap();
        assert_eq!(member.decrypt(&msg, &limits).unwrap(), b"after");
    }

    #[test]
    fn test_forged_signature_rejected() {
        let limits = RatchetLimits::default();
        let (mut sender, mut member) = sender_and_member();
        let mut msg = sender.encrypt(b"real").unwrap();
        msg.ciphertext[0] ^= 0x01;
        assert!(matches!(
            member.decrypt(&msg, &limits),
            Err(ProtocolError::InvalidSignature(_))
        ));
        assert_eq!(member.iteration(), 0);
    }

    #[test]
    fn test_wrong_key_id_rejected() {
        let limits = RatchetLimits::default();
        let (_, mut member) = sender_and_member();
        let mut other = SenderKeyState::generate();
        let msg = other.encrypt(b"elsewhere").unwrap();
        assert!(member.decrypt(&msg, &limits).is_err());
    }

    #[test]
    fn test_iteration_window() {
        let limits = RatchetLimits {
            max_skip: 2,
            max_cached_keys: 10,
        };
        let (mut sender, mut member) = sender_and_member();
        let msgs: Vec<_> = (0..4).map(|_| sender.encrypt(b"m").unwrap()).collect();
        assert!(matches!(
            member.decrypt(&msgs[3], &limits),
            Err(ProtocolError::CounterOutOfWindow { .. })
        ));
        assert!(member.decrypt(&msgs[2], &limits).is_ok());
    }

    #[test]
    fn test_distribution_debug_redacts_chain_key() {
        let debug = format!("{:?}", SenderKeyState::generate().distribution());
        assert!(debug.contains("REDACTED"));
    }
}
