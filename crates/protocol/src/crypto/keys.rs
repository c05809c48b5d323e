//! Identity keys, prekeys and published prekey bundles.
//!
//! An identity combines an X25519 agreement key (used by the key agreement)
//! with an Ed25519 signing key (used to sign prekeys and sender-key
//! messages). Prekeys are X25519 key pairs published ahead of time so that
//! peers can start a session while we are offline.

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};

/// Length of X25519 and Ed25519 public keys.
pub const KEY_LENGTH: usize = 32;

/// A 64-byte Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Creates a new Signature from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    fn as_ed25519(&self) -> Ed25519Signature {
        Ed25519Signature::from_bytes(&self.0)
    }
}

/// Signs `message` with a raw Ed25519 secret.
pub(crate) fn sign_with(secret: &[u8; KEY_LENGTH], message: &[u8]) -> Signature {
    let signing_key = SigningKey::from_bytes(secret);
    Signature(signing_key.sign(message).to_bytes())
}

/// Verifies `signature` over `message` against a raw Ed25519 public key.
pub(crate) fn verify_with(
    public: &[u8; KEY_LENGTH],
    message: &[u8],
    signature: &Signature,
) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public)
        .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
    verifying_key
        .verify(message, &signature.as_ed25519())
        .map_err(ProtocolError::from)
}

/// An X25519 key pair. The secret half is wiped on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    #[serde(with = "serde_bytes")]
    secret: [u8; KEY_LENGTH],
    #[serde(with = "serde_bytes")]
    #[zeroize(skip)]
    public: [u8; KEY_LENGTH],
}

impl KeyPair {
    /// Generates a fresh key pair from the operating system RNG.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    /// Rebuilds a key pair from its secret half.
    pub fn from_secret(secret: [u8; KEY_LENGTH]) -> Self {
        let public = PublicKey::from(&StaticSecret::from(secret)).to_bytes();
        Self { secret, public }
    }

    /// Returns the public half.
    pub fn public(&self) -> [u8; KEY_LENGTH] {
        self.public
    }

    /// Performs X25519 with a peer's public key.
    ///
    /// Low-order peer keys that would yield an all-zero secret are rejected.
    pub fn agree(&self, their_public: &[u8; KEY_LENGTH]) -> Result<[u8; KEY_LENGTH]> {
        let shared = StaticSecret::from(self.secret).diffie_hellman(&PublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(ProtocolError::InvalidPublicKey(
                "peer key produces a non-contributory secret".to_string(),
            ));
        }
        Ok(shared.to_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex_prefix(&self.public))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Public half of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    /// X25519 agreement key.
    #[serde(with = "serde_bytes")]
    pub agreement: [u8; KEY_LENGTH],
    /// Ed25519 verification key.
    #[serde(with = "serde_bytes")]
    pub signing: [u8; KEY_LENGTH],
}

impl IdentityKey {
    /// Concatenated key bytes, used as associated data.
    pub fn to_bytes(&self) -> [u8; 2 * KEY_LENGTH] {
        let mut out = [0u8; 2 * KEY_LENGTH];
        out[..KEY_LENGTH].copy_from_slice(&self.agreement);
        out[KEY_LENGTH..].copy_from_slice(&self.signing);
        out
    }

    /// Verifies a signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        verify_with(&self.signing, message, signature)
    }

    /// Human-readable fingerprint for out-of-band comparison.
    ///
    /// Formatted as groups of 4 hex characters separated by colons,
    /// for example: `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(self.to_bytes());
        hash[..16]
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// The local identity, including secret keys.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    agreement: KeyPair,
    #[serde(with = "serde_bytes")]
    signing_secret: [u8; KEY_LENGTH],
}

impl IdentityKeyPair {
    /// Generates a new random identity.
    pub fn generate() -> Self {
        Self {
            agreement: KeyPair::generate(),
            signing_secret: SigningKey::generate(&mut OsRng).to_bytes(),
        }
    }

    /// Returns the public identity.
    pub fn public(&self) -> IdentityKey {
        IdentityKey {
            agreement: self.agreement.public(),
            signing: SigningKey::from_bytes(&self.signing_secret)
                .verifying_key()
                .to_bytes(),
        }
    }

    /// Returns the agreement key pair.
    pub fn agreement(&self) -> &KeyPair {
        &self.agreement
    }

    /// Signs a message with the identity signing key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        sign_with(&self.signing_secret, message)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.public().fingerprint())
            .field("secret_keys", &"[REDACTED]")
            .finish()
    }
}

/// A medium-term prekey signed by the identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Identifier published in bundles.
    pub id: u32,
    /// Key pair.
    pub key_pair: KeyPair,
    /// Identity signature over the public key.
    pub signature: Signature,
}

impl SignedPreKey {
    /// Generates and signs a new prekey.
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let key_pair = KeyPair::generate();
        let signature = identity.sign(&key_pair.public());
        Self {
            id,
            key_pair,
            signature,
        }
    }
}

/// A single-use prekey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Identifier published in bundles.
    pub id: u32,
    /// Key pair.
    pub key_pair: KeyPair,
}

impl OneTimePreKey {
    /// Generates `count` prekeys with consecutive ids starting at `start`.
    pub fn generate_batch(start: u32, count: u32) -> Vec<Self> {
        (0..count)
            .map(|offset| Self {
                id: start.wrapping_add(offset),
                key_pair: KeyPair::generate(),
            })
            .collect()
    }
}

/// Public part of a one-time prekey, as carried in bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicPreKey {
    /// Identifier.
    pub id: u32,
    /// Public key.
    #[serde(with = "serde_bytes")]
    pub key: [u8; KEY_LENGTH],
}

/// Key material a peer publishes so others can start sessions with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Peer registration id.
    pub registration_id: u32,
    /// Peer identity.
    pub identity: IdentityKey,
    /// Id of the signed prekey.
    pub signed_prekey_id: u32,
    /// Signed prekey public key.
    #[serde(with = "serde_bytes")]
    pub signed_prekey: [u8; KEY_LENGTH],
    /// Identity signature over `signed_prekey`.
    pub signed_prekey_signature: Signature,
    /// Optional single-use prekey.
    pub one_time_prekey: Option<PublicPreKey>,
}

impl PreKeyBundle {
    /// Checks the signed prekey signature.
    pub fn verify(&self) -> Result<()> {
        self.identity
            .verify(&self.signed_prekey, &self.signed_prekey_signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_agreement_is_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        assert_eq!(
            alice.agree(&bob.public()).unwrap(),
            bob.agree(&alice.public()).unwrap()
        );
    }

    #[test]
    fn test_key_pair_rejects_low_order_point() {
        let alice = KeyPair::generate();
        assert!(alice.agree(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_key_pair_from_secret_is_stable() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_secret(pair.secret);
        assert_eq!(pair.public(), restored.public());
    }

    #[test]
    fn test_signature_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let signature = identity.sign(b"hello");
        assert!(identity.public().verify(b"hello", &signature).is_ok());
        assert!(identity.public().verify(b"hullo", &signature).is_err());
    }

    #[test]
    fn test_signature_with_corrupted_data() {
        let identity = IdentityKeyPair::generate();
        let mut bytes = *identity.sign(b"message").as_bytes();
        bytes[0] ^= 0xFF;
        assert!(identity
            .public()
            .verify(b"message", &Signature::from_bytes(bytes))
            .is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = IdentityKeyPair::generate().public().fingerprint();
        assert_eq!(fingerprint.len(), 39);
        assert_eq!(fingerprint.split(':').count(), 8);
    }

    #[test]
    fn test_signed_prekey_verifies_in_bundle() {
        let identity = IdentityKeyPair::generate();
        let signed = SignedPreKey::generate(7, &identity);
        let mut bundle = PreKeyBundle {
            registration_id: 1,
            identity: identity.public(),
            signed_prekey_id: signed.id,
            signed_prekey: signed.key_pair.public(),
            signed_prekey_signature: signed.signature,
            one_time_prekey: None,
        };
        assert!(bundle.verify().is_ok());

        bundle.signed_prekey[0] ^= 1;
        assert!(bundle.verify().is_err());
    }

    #[test]
    fn test_one_time_batch_ids() {
        let batch = OneTimePreKey::generate_batch(10, 3);
        let ids: Vec<_> = batch.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn test_identity_debug_redacts_secrets() {
        let debug = format!("{:?}", IdentityKeyPair::generate());
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("fingerprint"));
    }

    #[test]
    fn test_identity_msgpack_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let bytes = rmp_serde::to_vec(&identity).unwrap();
        let restored: IdentityKeyPair = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(identity.public(), restored.public());
    }
}
