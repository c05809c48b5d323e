//! Initial key agreement between two devices.
//!
//! The initiator combines its identity and a fresh base key with the
//! responder's identity, signed prekey and (optionally) one-time prekey.
//! Both sides arrive at the same 32-byte secret, which seeds the ratchet.

use zeroize::Zeroize;

use super::kdf::hkdf_sha256;
use super::keys::{IdentityKey, IdentityKeyPair, KeyPair, PreKeyBundle, KEY_LENGTH};
use crate::error::Result;

const X3DH_INFO: &[u8] = b"Parley_X3DH";

/// Output of the initiator side.
#[derive(Debug)]
pub struct InitiatorAgreement {
    /// Shared secret.
    pub shared_secret: [u8; 32],
    /// Public half of the base key, sent to the responder.
    pub base_key: [u8; KEY_LENGTH],
    /// One-time prekey id that was consumed, if any.
    pub one_time_prekey_id: Option<u32>,
}

fn derive(mut dh: Vec<u8>) -> Result<[u8; 32]> {
    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(&dh);
    dh.zeroize();
    let secret = hkdf_sha256(&[0u8; 32], &ikm, X3DH_INFO);
    ikm.zeroize();
    secret
}

/// Runs the agreement against a verified peer bundle.
///
/// The bundle signature is checked before any key material is used.
pub fn initiate(identity: &IdentityKeyPair, bundle: &PreKeyBundle) -> Result<InitiatorAgreement> {
    bundle.verify()?;
    let base = KeyPair::generate();

    let mut dh = Vec::with_capacity(4 * 32);
    dh.extend_from_slice(&identity.agreement().agree(&bundle.signed_prekey)?);
    dh.extend_from_slice(&base.agree(&bundle.identity.agreement)?);
    dh.extend_from_slice(&base.agree(&bundle.signed_prekey)?);
    if let Some(one_time) = &bundle.one_time_prekey {
        dh.extend_from_slice(&base.agree(&one_time.key)?);
    }

    Ok(InitiatorAgreement {
        shared_secret: derive(dh)?,
        base_key: base.public(),
        one_time_prekey_id: bundle.one_time_prekey.map(|k| k.id),
    })
}

/// Responder side of the agreement.
pub fn respond(
    identity: &IdentityKeyPair,
    signed_prekey: &KeyPair,
    one_time_prekey: Option<&KeyPair>,
    their_identity: &IdentityKey,
    their_base_key: &[u8; KEY_LENGTH],
) -> Result<[u8; 32]> {
    let mut dh = Vec::with_capacity(4 * 32);
    dh.extend_from_slice(&signed_prekey.agree(&their_identity.agreement)?);
    dh.extend_from_slice(&identity.agreement().agree(their_base_key)?);
    dh.extend_from_slice(&signed_prekey.agree(their_base_key)?);
    if let Some(one_time) = one_time_prekey {
        dh.extend_from_slice(&one_time.agree(their_base_key)?);
    }
    derive(dh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{OneTimePreKey, PublicPreKey, SignedPreKey};

    fn bundle_for(
        identity: &IdentityKeyPair,
        signed: &SignedPreKey,
        one_time: Option<&OneTimePreKey>,
    ) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: 42,
            identity: identity.public(),
            signed_prekey_id: signed.id,
            signed_prekey: signed.key_pair.public(),
            signed_prekey_signature: signed.signature,
            one_time_prekey: one_time.map(|k| PublicPreKey {
                id: k.id,
                key: k.key_pair.public(),
            }),
        }
    }

    #[test]
    fn test_agreement_with_one_time_prekey() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let signed = SignedPreKey::generate(1, &bob);
        let one_time = OneTimePreKey::generate_batch(5, 1).remove(0);

        let out = initiate(&alice, &bundle_for(&bob, &signed, Some(&one_time))).unwrap();
        assert_eq!(out.one_time_prekey_id, Some(5));

        let bob_secret = respond(
            &bob,
            &signed.key_pair,
            Some(&one_time.key_pair),
            &alice.public(),
            &out.base_key,
        )
        .unwrap();
        assert_eq!(out.shared_secret, bob_secret);
    }

    #[test]
    fn test_agreement_without_one_time_prekey() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let signed = SignedPreKey::generate(1, &bob);

        let out = initiate(&alice, &bundle_for(&bob, &signed, None)).unwrap();
        let bob_secret =
            respond(&bob, &signed.key_pair, None, &alice.public(), &out.base_key).unwrap();
        assert_eq!(out.shared_secret, bob_secret);
    }

    #[test]
    fn test_missing_one_time_prekey_diverges() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let signed = SignedPreKey::generate(1, &bob);
        let one_time = OneTimePreKey::generate_batch(5, 1).remove(0);

        let out = initiate(&alice, &bundle_for(&bob, &signed, Some(&one_time))).unwrap();
        let bob_secret =
            respond(&bob, &signed.key_pair, None, &alice.public(), &out.base_key).unwrap();
        assert_ne!(out.shared_secret, bob_secret);
    }

    #[test]
    fn test_forged_bundle_rejected() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let mallory = IdentityKeyPair::generate();
        let signed = SignedPreKey::generate(1, &mallory);

        assert!(initiate(&alice, &bundle_for(&bob, &signed, None)).is_err());
    }
}
