//! Local device identity and prekey provisioning.

use protocol::crypto::{
    IdentityKeyPair, OneTimePreKey, PreKeyBundle, PublicPreKey, SignedPreKey,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::SignalStore;

/// Long-term keys of this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIdentity {
    /// Registration id announced to peers.
    pub registration_id: u32,
    /// Index of this device under its user.
    pub device_id: u16,
    /// Identity key pair.
    pub identity: IdentityKeyPair,
    /// Current signed prekey.
    pub signed_prekey: SignedPreKey,
}

impl LocalIdentity {
    /// Generates a new identity with a fresh signed prekey.
    pub fn generate(registration_id: u32, device_id: u16) -> Self {
        let identity = IdentityKeyPair::generate();
        let signed_prekey = SignedPreKey::generate(1, &identity);
        Self {
            registration_id,
            device_id,
            identity,
            signed_prekey,
        }
    }

    /// Random registration id in the 14-bit range peers expect.
    pub fn random_registration_id() -> u32 {
        rand::thread_rng().gen_range(1..16380)
    }

    /// Generates an identity and installs it with `one_time_count` prekeys.
    pub fn provision(
        store: &dyn SignalStore,
        registration_id: u32,
        device_id: u16,
        one_time_count: u32,
    ) -> Result<Self, StoreError> {
        let local = Self::generate(registration_id, device_id);
        store.set_local_identity(&local)?;
        store.store_one_time_prekeys(OneTimePreKey::generate_batch(1, one_time_count))?;
        tracing::info!(
            registration_id,
            device_id,
            one_time_prekeys = one_time_count,
            fingerprint = %local.identity.public().fingerprint(),
            "Provisioned local identity"
        );
        Ok(local)
    }

    /// Public bundle advertising the given one-time prekey.
    pub fn bundle(&self, one_time: Option<&OneTimePreKey>) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: self.registration_id,
            identity: self.identity.public(),
            signed_prekey_id: self.signed_prekey.id,
            signed_prekey: self.signed_prekey.key_pair.public(),
            signed_prekey_signature: self.signed_prekey.signature,
            one_time_prekey: one_time.map(|k| PublicPreKey {
                id: k.id,
                key: k.key_pair.public(),
            }),
        }
    }
}
