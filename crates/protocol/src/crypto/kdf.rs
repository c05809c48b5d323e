//! Key derivation and authenticated encryption helpers.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

const RATCHET_INFO: &[u8] = b"Parley_Ratchet";
const MESSAGE_KEYS_INFO: &[u8] = b"Parley_MessageKeys";

const MESSAGE_SEED_BYTE: u8 = 0x01;
const CHAIN_KEY_BYTE: u8 = 0x02;

/// Size of the AEAD nonce.
pub const NONCE_LENGTH: usize = 12;

/// Expands `ikm` into `N` bytes with HKDF-SHA256.
pub fn hkdf_sha256<const N: usize>(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; N]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|e| ProtocolError::InvalidKeyMaterial(e.to_string()))?;
    Ok(okm)
}

/// Root chain step: mixes a fresh agreement output into the root key.
///
/// Returns `(new_root_key, chain_key)`.
pub fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let okm: [u8; 64] = hkdf_sha256(root_key, dh_output, RATCHET_INFO)?;
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    Ok((root, chain))
}

fn hmac(key: &[u8; 32], input: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ProtocolError::InvalidKeyMaterial(e.to_string()))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().into())
}

/// Symmetric chain step.
///
/// Returns `(message_seed, next_chain_key)`.
pub fn kdf_ck(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    Ok((
        hmac(chain_key, &[MESSAGE_SEED_BYTE])?,
        hmac(chain_key, &[CHAIN_KEY_BYTE])?,
    ))
}

/// Per-message key and nonce, derived from a message seed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    key: [u8; 32],
    nonce: [u8; NONCE_LENGTH],
}

impl MessageKeys {
    /// Derives the key and nonce for one message.
    pub fn derive(seed: &[u8; 32]) -> Result<Self> {
        let okm: [u8; 32 + NONCE_LENGTH] = hkdf_sha256(&[0u8; 32], seed, MESSAGE_KEYS_INFO)?;
        let mut key = [0u8; 32];
        let mut nonce = [0u8; NONCE_LENGTH];
        key.copy_from_slice(&okm[..32]);
        nonce.copy_from_slice(&okm[32..]);
        Ok(Self { key, nonce })
    }

    /// Encrypts `plaintext`, binding `aad`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .encrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| ProtocolError::Encryption("AEAD seal failed".to_string()))
    }

    /// Decrypts `ciphertext`, checking `aad`.
    pub fn open(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_ck_outputs_differ() {
        let (seed, next) = kdf_ck(&[7u8; 32]).unwrap();
        assert_ne!(seed, next);
        assert_ne!(next, [7u8; 32]);
    }

    #[test]
    fn test_kdf_ck_deterministic() {
        assert_eq!(kdf_ck(&[1u8; 32]).unwrap(), kdf_ck(&[1u8; 32]).unwrap());
    }

    #[test]
    fn test_kdf_rk_depends_on_both_inputs() {
        let a = kdf_rk(&[1u8; 32], &[2u8; 32]).unwrap();
        let b = kdf_rk(&[1u8; 32], &[3u8; 32]).unwrap();
        let c = kdf_rk(&[4u8; 32], &[2u8; 32]).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_seal_open() {
        let keys = MessageKeys::derive(&[9u8; 32]).unwrap();
        let sealed = keys.seal(b"hello", b"aad").unwrap();
        assert_eq!(keys.open(&sealed, b"aad").unwrap(), b"hello");
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        let keys = MessageKeys::derive(&[9u8; 32]).unwrap();
        let sealed = keys.seal(b"hello", b"aad").unwrap();
        assert!(matches!(
            keys.open(&sealed, b"other"),
            Err(ProtocolError::Decryption(_))
        ));
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let keys = MessageKeys::derive(&[9u8; 32]).unwrap();
        let mut sealed = keys.seal(b"hello", b"").unwrap();
        sealed[0] ^= 0x80;
        assert!(keys.open(&sealed, b"").is_err());
    }
}
