//! Per-device session repository.
//!
//! # Overview
//!
//! [`SessionRepository`] owns every ratchet session this device holds with
//! other devices, plus the sender keys used for group broadcasts. It turns
//! plaintext into typed [`Envelope`]s and back.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     SessionRepository                      │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────────┐   │
//! │  │ device locks │  │ BundleFetcher│  │   SignalStore   │   │
//! │  │  (DashMap)   │  │  (external)  │  │ (records, keys) │   │
//! │  └──────────────┘  └──────────────┘  └─────────────────┘   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation on a device holds that device's lock across its whole
//! load, mutate and store sequence. Operations on different devices run
//! concurrently. Bundle lookups happen before the lock is taken, so a slow
//! lookup never blocks other work on the same device.
//!
//! A failed decryption never writes to the store: ratchet states are
//! decrypted on a copy and the copy is committed only after the ciphertext
//! authenticates.
//!
//! # Modules
//!
//! - [`bundles`] - Prekey bundle lookup seam
//! - [`identity`] - Local identity and prekey provisioning
//! - [`record`] - Persisted session records

pub mod bundles;
pub mod identity;
pub mod record;

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::crypto::{
    x3dh, IdentityKey, PreKeyBundle, RatchetLimits, RatchetMessage, RatchetState,
    SenderKeyDistribution, SenderKeyMessage, SenderKeyState,
};
use protocol::messages::{decode_versioned, encode_versioned};
use protocol::{DeviceAddress, Envelope, EnvelopeKind, PreKeyEnvelope};
use tokio::sync::Mutex;

use crate::error::{SessionError, StoreError};
use crate::store::{BundleMarker, SignalStore};

pub use bundles::{BundleFetchError, BundleFetcher, NoBundles, StaticBundles};
pub use identity::LocalIdentity;
pub use record::{PendingPreKey, SessionRecord, SessionState, StateSlot};

/// Default number of replaced session states kept per device.
pub const DEFAULT_MAX_ARCHIVED_STATES: usize = 40;

/// Lock table size above which unused locks are swept.
const LOCK_SWEEP_THRESHOLD: usize = 1024;

/// Tunables of the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Out-of-order tolerance of every ratchet.
    pub limits: RatchetLimits,
    /// Replaced states kept per device.
    pub max_archived_states: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            limits: RatchetLimits::default(),
            max_archived_states: DEFAULT_MAX_ARCHIVED_STATES,
        }
    }
}

/// What a lock serializes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Device(DeviceAddress),
    OwnGroup(String),
    GroupSender(String, DeviceAddress),
}

/// Owns the sessions of one local device.
pub struct SessionRepository {
    address: DeviceAddress,
    local: LocalIdentity,
    store: Arc<dyn SignalStore>,
    bundles: Arc<dyn BundleFetcher>,
    config: RepositoryConfig,
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl SessionRepository {
    /// Creates a repository for the local device at `address`.
    pub fn new(
        address: DeviceAddress,
        local: LocalIdentity,
        store: Arc<dyn SignalStore>,
        bundles: Arc<dyn BundleFetcher>,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            address,
            local,
            store,
            bundles,
            config,
            locks: DashMap::new(),
        }
    }

    /// Address of the local device.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Local identity.
    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn SignalStore> {
        &self.store
    }

    /// Repository tunables.
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    fn lock_for(&self, key: LockKey) -> Arc<Mutex<()>> {
        if self.locks.len() > LOCK_SWEEP_THRESHOLD {
            // Only the table holds an unused lock.
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// True if an active session with `address` exists.
    pub fn has_session(&self, address: &DeviceAddress) -> Result<bool, SessionError> {
        Ok(self
            .store
            .load_session(address)?
            .is_some_and(|record| record.current().is_some()))
    }

    /// Starts a session with `address` from a fetched bundle.
    ///
    /// The bundle is consumed. Handing a bundle whose one-time prekey was
    /// already used fails with [`SessionError::BundleReused`]. A bundle with
    /// only a signed prekey can be used again, as after a session reset.
    pub async fn fresh_session(
        &self,
        address: &DeviceAddress,
        bundle: PreKeyBundle,
    ) -> Result<(), SessionError> {
        let lock = self.lock_for(LockKey::Device(address.clone()));
        let _guard = lock.lock().await;
        self.install_bundle(address, bundle)
    }

    fn install_bundle(
        &self,
        address: &DeviceAddress,
        bundle: PreKeyBundle,
    ) -> Result<(), SessionError> {
        let marker = bundle.one_time_prekey.map(|key| BundleMarker {
            address: address.clone(),
            identity: bundle.identity.fingerprint(),
            one_time_prekey_id: key.id,
        });
        if let Some(marker) = &marker {
            if self.store.is_bundle_consumed(marker)? {
                return Err(SessionError::BundleReused(address.clone()));
            }
        }

        let agreement = x3dh::initiate(&self.local.identity, &bundle).map_err(|e| {
            SessionError::BundleUnavailable {
                address: address.clone(),
                reason: e.to_string(),
            }
        })?;
        let ratchet = RatchetState::initiator(
            &agreement.shared_secret,
            &bundle.signed_prekey,
            self.local.identity.public(),
            bundle.identity,
        )
        .map_err(|e| SessionError::from_protocol(address, e))?;

        let state = SessionState {
            ratchet,
            base_key: agreement.base_key,
            remote_registration_id: bundle.registration_id,
            pending_prekey: Some(PendingPreKey {
                prekey_id: agreement.one_time_prekey_id,
                signed_prekey_id: bundle.signed_prekey_id,
                base_key: agreement.base_key,
            }),
        };

        let mut record = self.store.load_session(address)?.unwrap_or_default();
        let replaced = record.current().is_some();
        record.promote(state, self.config.max_archived_states);
        self.store.store_session(address, &record)?;
        self.note_identity(address, &bundle.identity)?;
        if let Some(marker) = &marker {
            self.store.mark_bundle_consumed(marker)?;
        }

        tracing::info!(
            address = %address,
            one_time_prekey = ?agreement.one_time_prekey_id,
            replaced,
            "Created outgoing session"
        );
        Ok(())
    }

    /// Records the identity of `address`, warning when it changed.
    fn note_identity(
        &self,
        address: &DeviceAddress,
        identity: &IdentityKey,
    ) -> Result<(), StoreError> {
        match self.store.remote_identity(address)? {
            Some(known) if known == *identity => return Ok(()),
            Some(known) => tracing::warn!(
                address = %address,
                previous = %known.fingerprint(),
                current = %identity.fingerprint(),
                "Identity key changed"
            ),
            None => {}
        }
        self.store.save_remote_identity(address, identity)
    }

    async fn fetch_bundle(&self, address: &DeviceAddress) -> Result<PreKeyBundle, SessionError> {
        self.bundles
            .fetch(address)
            .await
            .map_err(|e| SessionError::BundleUnavailable {
                address: address.clone(),
                reason: e.to_string(),
            })
    }

    /// Makes sure a session with `address` exists, fetching a bundle if not.
    pub async fn ensure_session(&self, address: &DeviceAddress) -> Result<(), SessionError> {
        if self.has_session(address)? {
            return Ok(());
        }
        let bundle = self.fetch_bundle(address).await?;

        let lock = self.lock_for(LockKey::Device(address.clone()));
        let _guard = lock.lock().await;
        // Another task may have finished a bootstrap while we were fetching.
        if self.has_session(address)? {
            tracing::debug!(
                address = %address,
                one_time_prekey = ?bundle.one_time_prekey.map(|k| k.id),
                "Session appeared during bundle fetch, discarding fetched bundle"
            );
            return Ok(());
        }
        self.install_bundle(address, bundle)
    }

    /// Makes sure sessions exist with all `addresses`, concurrently.
    ///
    /// Returns one error per device that could not be bootstrapped.
    pub async fn assert_sessions(&self, addresses: &[DeviceAddress]) -> Vec<SessionError> {
        join_all(addresses.iter().map(|address| self.ensure_session(address)))
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }

    /// Encrypts `plaintext` for one device.
    ///
    /// Bootstraps a session through the bundle fetcher when none exists.
    /// Until the peer's first reply arrives the result is a
    /// [`EnvelopeKind::PreKey`] envelope, afterwards [`EnvelopeKind::Message`].
    pub async fn encrypt(
        &self,
        address: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<Envelope, SessionError> {
        self.ensure_session(address).await?;

        let lock = self.lock_for(LockKey::Device(address.clone()));
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .load_session(address)?
            .ok_or_else(|| SessionError::NoSession(address.clone()))?;
        let state = record
            .current_mut()
            .ok_or_else(|| SessionError::NoSession(address.clone()))?;

        let message = state
            .ratchet
            .encrypt(plaintext)
            .map_err(|e| SessionError::from_protocol(address, e))?;
        let counter = message.header.counter;
        let encoded = match state.pending_prekey {
            Some(pending) => encode_versioned(&PreKeyEnvelope {
                registration_id: self.local.registration_id,
                prekey_id: pending.prekey_id,
                signed_prekey_id: pending.signed_prekey_id,
                base_key: pending.base_key,
                identity: self.local.identity.public(),
                message,
            })
            .map(|body| Envelope::new(EnvelopeKind::PreKey, body)),
            None => encode_versioned(&message)
                .map(|body| Envelope::new(EnvelopeKind::Message, body)),
        };
        let envelope = encoded.map_err(|e| SessionError::EncryptionFailure {
            address: address.clone(),
            reason: e.to_string(),
        })?;

        self.store.store_session(address, &record)?;
        tracing::trace!(address = %address, kind = %envelope.kind, counter, "Encrypted message");
        Ok(envelope)
    }

    /// Decrypts an envelope received from one device.
    pub async fn decrypt(
        &self,
        address: &DeviceAddress,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, SessionError> {
        let lock = self.lock_for(LockKey::Device(address.clone()));
        let _guard = lock.lock().await;

        match envelope.kind {
            EnvelopeKind::PreKey => self.decrypt_prekey(address, &envelope.ciphertext),
            EnvelopeKind::Message => self.decrypt_message(address, &envelope.ciphertext),
            EnvelopeKind::SenderKey => Err(SessionError::MalformedEnvelope {
                address: address.clone(),
                reason: "sender-key envelope addressed to a device session".to_string(),
            }),
        }
    }

    fn decrypt_prekey(&self, address: &DeviceAddress, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        let body: PreKeyEnvelope =
            decode_versioned(body).map_err(|e| SessionError::from_protocol(address, e))?;
        let limits = self.config.limits;
        let mut record = self.store.load_session(address)?.unwrap_or_default();

        // Retransmitted bootstrap of a session we already hold.
        if let Some(slot) = record.find_base_key(&body.base_key) {
            let mut state = record
                .get(slot)
                .cloned()
                .ok_or_else(|| SessionError::NoSession(address.clone()))?;
            let plaintext = state
                .ratchet
                .decrypt(&body.message, &limits)
                .map_err(|e| SessionError::from_protocol(address, e))?;
            record.set(slot, state);
            if let StateSlot::Archived(index) = slot {
                record.restore_archived(index, self.config.max_archived_states);
            }
            self.store.store_session(address, &record)?;
            return Ok(plaintext);
        }

        if body.signed_prekey_id != self.local.signed_prekey.id {
            return Err(SessionError::InvalidPreKey {
                address: address.clone(),
                prekey_id: body.signed_prekey_id,
            });
        }
        let one_time = match body.prekey_id {
            Some(id) => Some(self.store.one_time_prekey(id)?.ok_or_else(|| {
                SessionError::InvalidPreKey {
                    address: address.clone(),
                    prekey_id: id,
                }
            })?),
            None => None,
        };

        let shared_secret = x3dh::respond(
            &self.local.identity,
            &self.local.signed_prekey.key_pair,
            one_time.as_ref().map(|k| &k.key_pair),
            &body.identity,
            &body.base_key,
        )
        .map_err(|e| SessionError::from_protocol(address, e))?;
        let mut ratchet = RatchetState::responder(
            &shared_secret,
            self.local.signed_prekey.key_pair.clone(),
            self.local.identity.public(),
            body.identity,
        );
        let plaintext = ratchet
            .decrypt(&body.message, &limits)
            .map_err(|e| SessionError::from_protocol(address, e))?;

        let replaced = record.current().is_some();
        record.promote(
            SessionState {
                ratchet,
                base_key: body.base_key,
                remote_registration_id: body.registration_id,
                pending_prekey: None,
            },
            self.config.max_archived_states,
        );
        self.store.store_session(address, &record)?;
        self.note_identity(address, &body.identity)?;
        if let Some(key) = one_time {
            self.store.remove_one_time_prekey(key.id)?;
        }

        tracing::info!(
            address = %address,
            one_time_prekey = ?body.prekey_id,
            replaced,
            "Created incoming session"
        );
        Ok(plaintext)
    }

    fn decrypt_message(&self, address: &DeviceAddress, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        let message: RatchetMessage =
            decode_versioned(body).map_err(|e| SessionError::from_protocol(address, e))?;
        let mut record = self
            .store
            .load_session(address)?
            .ok_or_else(|| SessionError::NoSession(address.clone()))?;

        let slots = std::iter::once(StateSlot::Current)
            .chain((0..record.archived_len()).map(StateSlot::Archived));
        let mut first_error = None;
        for slot in slots {
            let Some(state) = record.get(slot) else {
                continue;
            };
            let mut candidate = state.clone();
            match candidate.ratchet.decrypt(&message, &self.config.limits) {
                Ok(plaintext) => {
                    // The peer answered, so it holds this session.
                    candidate.pending_prekey = None;
                    record.set(slot, candidate);
                    if let StateSlot::Archived(index) = slot {
                        tracing::info!(address = %address, index, "Restored archived session");
                        record.restore_archived(index, self.config.max_archived_states);
                    }
                    self.store.store_session(address, &record)?;
                    return Ok(plaintext);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        let err = match first_error {
            Some(e) => SessionError::from_protocol(address, e),
            None => SessionError::NoSession(address.clone()),
        };
        tracing::debug!(address = %address, error = %err, "Decryption failed");
        Err(err)
    }

    /// Destroys the session with `address`.
    ///
    /// Returns whether a session existed. The next send bootstraps anew.
    pub async fn reset_session(&self, address: &DeviceAddress) -> Result<bool, SessionError> {
        let lock = self.lock_for(LockKey::Device(address.clone()));
        let _guard = lock.lock().await;
        let removed = self.store.remove_session(address)?;
        if removed {
            tracing::info!(address = %address, "Session reset");
        }
        Ok(removed)
    }

    /// Encrypts `plaintext` with our sender key for `group`.
    ///
    /// Creates the sender key on first use. Returns the encoded group
    /// ciphertext and the distribution that lets a member decrypt it.
    pub async fn encrypt_group(
        &self,
        group: &str,
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, SenderKeyDistribution), SessionError> {
        let lock = self.lock_for(LockKey::OwnGroup(group.to_string()));
        let _guard = lock.lock().await;

        let mut state = match self.store.own_sender_key(group)? {
            Some(state) => state,
            None => {
                let state = SenderKeyState::generate();
                tracing::info!(group, key_id = state.key_id(), "Created sender key");
                state
            }
        };
        let distribution = state.distribution();
        let encrypted = state
            .encrypt(plaintext)
            .and_then(|message| encode_versioned(&message))
            .map_err(|e| SessionError::EncryptionFailure {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
        self.store.store_own_sender_key(group, &state)?;
        Ok((encrypted, distribution))
    }

    /// Decrypts a group ciphertext from `sender`.
    pub async fn decrypt_group(
        &self,
        group: &str,
        sender: &DeviceAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let lock = self.lock_for(LockKey::GroupSender(group.to_string(), sender.clone()));
        let _guard = lock.lock().await;

        let message: SenderKeyMessage =
            decode_versioned(ciphertext).map_err(|e| SessionError::from_protocol(sender, e))?;
        let mut state = self.store.sender_key(group, sender)?.ok_or_else(|| {
            SessionError::NoSenderKey {
                address: sender.clone(),
                group: group.to_string(),
            }
        })?;
        let plaintext = state
            .decrypt(&message, &self.config.limits)
            .map_err(|e| SessionError::from_protocol(sender, e))?;
        self.store.store_sender_key(group, sender, &state)?;
        Ok(plaintext)
    }

    /// Installs a member's sender key.
    ///
    /// A distribution for the key already held is ignored, so a resent
    /// distribution cannot rewind the chain.
    pub async fn process_sender_key_distribution(
        &self,
        group: &str,
        sender: &DeviceAddress,
        distribution: &SenderKeyDistribution,
    ) -> Result<(), SessionError> {
        let lock = self.lock_for(LockKey::GroupSender(group.to_string(), sender.clone()));
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.sender_key(group, sender)? {
            if existing.key_id() == distribution.key_id {
                tracing::debug!(group, sender = %sender, "Sender key already installed");
                return Ok(());
            }
        }
        self.store
            .store_sender_key(group, sender, &SenderKeyState::from_distribution(distribution))?;
        tracing::info!(
            group,
            sender = %sender,
            key_id = distribution.key_id,
            "Installed sender key"
        );
        Ok(())
    }

    /// Devices known to hold our current sender key for `group`.
    pub fn sender_key_recipients(
        &self,
        group: &str,
    ) -> Result<BTreeSet<DeviceAddress>, SessionError> {
        Ok(self.store.sender_key_recipients(group)?)
    }

    /// Remembers that `devices` received our sender key for `group`.
    pub fn mark_sender_key_recipients(
        &self,
        group: &str,
        devices: &[DeviceAddress],
    ) -> Result<(), SessionError> {
        Ok(self.store.add_sender_key_recipients(group, devices)?)
    }

    /// Records that `devices` received our sender key `key_id` for `group`.
    ///
    /// Call once the distribution was actually sent. Returns false, recording
    /// nothing, when the key was rotated in the meantime.
    pub async fn commit_sender_key_delivery(
        &self,
        group: &str,
        key_id: u32,
        devices: &[DeviceAddress],
    ) -> Result<bool, SessionError> {
        let lock = self.lock_for(LockKey::OwnGroup(group.to_string()));
        let _guard = lock.lock().await;

        let current = self.store.own_sender_key(group)?.map(|state| state.key_id());
        if current != Some(key_id) {
            tracing::debug!(group, key_id, "Sender key rotated before delivery was recorded");
            return Ok(false);
        }
        self.store.add_sender_key_recipients(group, devices)?;
        Ok(true)
    }

    /// Discards our sender key for `group`; the next group send creates a
    /// new one and redistributes it to every member.
    pub async fn rotate_sender_key(&self, group: &str) -> Result<(), SessionError> {
        let lock = self.lock_for(LockKey::OwnGroup(group.to_string()));
        let _guard = lock.lock().await;
        self.store.remove_own_sender_key(group)?;
        tracing::info!(group, "Rotated sender key");
        Ok(())
    }

    /// Public bundle advertising our lowest unused one-time prekey.
    pub fn local_bundle(&self) -> Result<PreKeyBundle, StoreError> {
        let one_time = self.store.first_one_time_prekey()?;
        Ok(self.local.bundle(one_time.as_ref()))
    }
}
