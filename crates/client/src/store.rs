//! Persistent key and session storage.
//!
//! [`SignalStore`] is the persistence seam of the session layer. It is
//! synchronous: callers hold the per-device lock of the repository while
//! they load, mutate and store, so the store itself only needs to be
//! internally consistent.
//!
//! [`FileStore`] keeps everything in one JSON document at
//! `~/.local/share/parley/sessions.json`. Key material inside the document
//! is MessagePack, base64 encoded. Writes are atomic (temp file + rename).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::Engine;
use protocol::crypto::{IdentityKey, OneTimePreKey, SenderKeyState};
use protocol::DeviceAddress;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StoreError;
use crate::signal::{LocalIdentity, SessionRecord};

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Consumed one-time prekey ids remembered per device.
pub const MAX_CONSUMED_PREKEYS_PER_DEVICE: usize = 256;

/// Identifies the one-time prekey of a consumed bundle.
///
/// Bundles without a one-time prekey are never marked: each bootstrap from
/// them uses a fresh base key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleMarker {
    /// Device the bundle belongs to.
    pub address: DeviceAddress,
    /// Fingerprint of the bundle's identity.
    pub identity: String,
    /// One-time prekey id.
    pub one_time_prekey_id: u32,
}

/// Storage for identities, prekeys, sessions and sender keys.
pub trait SignalStore: Send + Sync {
    /// Our own identity, if provisioned.
    fn local_identity(&self) -> StoreResult<Option<LocalIdentity>>;
    /// Installs our own identity.
    fn set_local_identity(&self, local: &LocalIdentity) -> StoreResult<()>;

    /// One of our one-time prekeys.
    fn one_time_prekey(&self, id: u32) -> StoreResult<Option<OneTimePreKey>>;
    /// Adds one-time prekeys.
    fn store_one_time_prekeys(&self, keys: Vec<OneTimePreKey>) -> StoreResult<()>;
    /// Deletes a one-time prekey; returns whether it existed.
    fn remove_one_time_prekey(&self, id: u32) -> StoreResult<bool>;
    /// Number of unused one-time prekeys.
    fn one_time_prekey_count(&self) -> StoreResult<usize>;
    /// Lowest-id unused one-time prekey.
    fn first_one_time_prekey(&self) -> StoreResult<Option<OneTimePreKey>>;

    /// Session record with a device.
    fn load_session(&self, address: &DeviceAddress) -> StoreResult<Option<SessionRecord>>;
    /// Replaces the session record with a device.
    fn store_session(&self, address: &DeviceAddress, record: &SessionRecord) -> StoreResult<()>;
    /// Deletes the session record; returns whether it existed.
    fn remove_session(&self, address: &DeviceAddress) -> StoreResult<bool>;
    /// All devices with a stored session.
    fn session_addresses(&self) -> StoreResult<Vec<DeviceAddress>>;

    /// Last identity seen for a device.
    fn remote_identity(&self, address: &DeviceAddress) -> StoreResult<Option<IdentityKey>>;
    /// Records the identity of a device.
    fn save_remote_identity(&self, address: &DeviceAddress, identity: &IdentityKey)
        -> StoreResult<()>;

    /// True if the bundle's one-time prekey was already used.
    fn is_bundle_consumed(&self, marker: &BundleMarker) -> StoreResult<bool>;
    /// Records a bundle as used.
    ///
    /// Markers of an older identity of the device are dropped, and at most
    /// [`MAX_CONSUMED_PREKEYS_PER_DEVICE`] ids are kept, lowest evicted first.
    fn mark_bundle_consumed(&self, marker: &BundleMarker) -> StoreResult<()>;

    /// Our sender key for a group.
    fn own_sender_key(&self, group: &str) -> StoreResult<Option<SenderKeyState>>;
    /// Stores our sender key for a group.
    fn store_own_sender_key(&self, group: &str, state: &SenderKeyState) -> StoreResult<()>;
    /// Drops our sender key for a group and forgets who holds it.
    fn remove_own_sender_key(&self, group: &str) -> StoreResult<()>;

    /// A member's sender key.
    fn sender_key(&self, group: &str, sender: &DeviceAddress)
        -> StoreResult<Option<SenderKeyState>>;
    /// Stores a member's sender key.
    fn store_sender_key(
        &self,
        group: &str,
        sender: &DeviceAddress,
        state: &SenderKeyState,
    ) -> StoreResult<()>;

    /// Devices known to hold our current sender key for a group.
    fn sender_key_recipients(&self, group: &str) -> StoreResult<BTreeSet<DeviceAddress>>;
    /// Remembers devices that received our sender key.
    fn add_sender_key_recipients(&self, group: &str, devices: &[DeviceAddress])
        -> StoreResult<()>;
}

/// Value persisted as base64-encoded MessagePack.
#[derive(Debug, Clone)]
struct Packed<T>(T);

impl<T: Serialize> Serialize for Packed<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = rmp_serde::to_vec(&self.0).map_err(serde::ser::Error::custom)?;
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(serializer)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Packed<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)?;
        rmp_serde::from_slice(&bytes)
            .map(Packed)
            .map_err(serde::de::Error::custom)
    }
}

/// One-time prekeys of one device that we already bootstrapped from.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConsumedPreKeys {
    identity: String,
    ids: BTreeSet<u32>,
}

/// The persisted document.
#[derive(Debug, Serialize, Deserialize)]
struct StoreData {
    /// Version of the store format (for future migrations).
    version: u32,
    local: Option<Packed<LocalIdentity>>,
    one_time_prekeys: BTreeMap<u32, Packed<OneTimePreKey>>,
    sessions: BTreeMap<String, Packed<SessionRecord>>,
    identities: BTreeMap<String, Packed<IdentityKey>>,
    #[serde(default)]
    consumed_prekeys: BTreeMap<String, ConsumedPreKeys>,
    own_sender_keys: BTreeMap<String, Packed<SenderKeyState>>,
    sender_keys: BTreeMap<String, Packed<SenderKeyState>>,
    sender_key_recipients: BTreeMap<String, BTreeSet<String>>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            version: 2,
            local: None,
            one_time_prekeys: BTreeMap::new(),
            sessions: BTreeMap::new(),
            identities: BTreeMap::new(),
            consumed_prekeys: BTreeMap::new(),
            own_sender_keys: BTreeMap::new(),
            sender_keys: BTreeMap::new(),
            sender_key_recipients: BTreeMap::new(),
        }
    }
}

fn sender_key_id(group: &str, sender: &DeviceAddress) -> String {
    format!("{group}::{sender}")
}

/// Thread-safe store persisting to a JSON document.
///
/// An in-memory instance (no path) never touches the filesystem.
pub struct FileStore {
    path: Option<PathBuf>,
    data: RwLock<StoreData>,
}

impl FileStore {
    /// Opens the store at `path`, loading it if the file exists.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let data: StoreData = serde_json::from_str(&contents)?;
            tracing::info!(
                path = %path.display(),
                sessions = data.sessions.len(),
                "Loaded session store"
            );
            data
        } else {
            tracing::debug!(path = %path.display(), "Session store not found, starting empty");
            StoreData::default()
        };
        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Creates a store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoreData::default()),
        }
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read<R>(&self, f: impl FnOnce(&StoreData) -> R) -> StoreResult<R> {
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&data))
    }

    /// Applies `f` and persists the result.
    fn write<R>(&self, f: impl FnOnce(&mut StoreData) -> R) -> StoreResult<R> {
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        let result = f(&mut data);
        self.persist(&data)?;
        Ok(result)
    }

    fn persist(&self, data: &StoreData) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(data)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl SignalStore for FileStore {
    fn local_identity(&self) -> StoreResult<Option<LocalIdentity>> {
        self.read(|d| d.local.as_ref().map(|p| p.0.clone()))
    }

    fn set_local_identity(&self, local: &LocalIdentity) -> StoreResult<()> {
        self.write(|d| d.local = Some(Packed(local.clone())))
    }

    fn one_time_prekey(&self, id: u32) -> StoreResult<Option<OneTimePreKey>> {
        self.read(|d| d.one_time_prekeys.get(&id).map(|p| p.0.clone()))
    }

    fn store_one_time_prekeys(&self, keys: Vec<OneTimePreKey>) -> StoreResult<()> {
        self.write(|d| {
            for key in keys {
                d.one_time_prekeys.insert(key.id, Packed(key));
            }
        })
    }

    fn remove_one_time_prekey(&self, id: u32) -> StoreResult<bool> {
        self.write(|d| d.one_time_prekeys.remove(&id).is_some())
    }

    fn one_time_prekey_count(&self) -> StoreResult<usize> {
        self.read(|d| d.one_time_prekeys.len())
    }

    fn first_one_time_prekey(&self) -> StoreResult<Option<OneTimePreKey>> {
        self.read(|d| d.one_time_prekeys.values().next().map(|p| p.0.clone()))
    }

    fn load_session(&self, address: &DeviceAddress) -> StoreResult<Option<SessionRecord>> {
        self.read(|d| d.sessions.get(&address.to_string()).map(|p| p.0.clone()))
    }

    fn store_session(&self, address: &DeviceAddress, record: &SessionRecord) -> StoreResult<()> {
        self.write(|d| {
            d.sessions
                .insert(address.to_string(), Packed(record.clone()));
        })
    }

    fn remove_session(&self, address: &DeviceAddress) -> StoreResult<bool> {
        self.write(|d| d.sessions.remove(&address.to_string()).is_some())
    }

    fn session_addresses(&self) -> StoreResult<Vec<DeviceAddress>> {
        self.read(|d| {
            d.sessions
                .keys()
                .filter_map(|key| key.parse().ok())
                .collect()
        })
    }

    fn remote_identity(&self, address: &DeviceAddress) -> StoreResult<Option<IdentityKey>> {
        self.read(|d| d.identities.get(&address.to_string()).map(|p| p.0))
    }

    fn save_remote_identity(
        &self,
        address: &DeviceAddress,
        identity: &IdentityKey,
    ) -> StoreResult<()> {
        self.write(|d| {
            d.identities.insert(address.to_string(), Packed(*identity));
        })
    }

    fn is_bundle_consumed(&self, marker: &BundleMarker) -> StoreResult<bool> {
        self.read(|d| {
            d.consumed_prekeys
                .get(&marker.address.to_string())
                .is_some_and(|consumed| {
                    consumed.identity == marker.identity
                        && consumed.ids.contains(&marker.one_time_prekey_id)
                })
        })
    }

    fn mark_bundle_consumed(&self, marker: &BundleMarker) -> StoreResult<()> {
        self.write(|d| {
            let consumed = d
                .consumed_prekeys
                .entry(marker.address.to_string())
                .or_default();
            if consumed.identity != marker.identity {
                consumed.identity = marker.identity.clone();
                consumed.ids.clear();
            }
            consumed.ids.insert(marker.one_time_prekey_id);
            while consumed.ids.len() > MAX_CONSUMED_PREKEYS_PER_DEVICE {
                consumed.ids.pop_first();
            }
        })
    }

    fn own_sender_key(&self, group: &str) -> StoreResult<Option<SenderKeyState>> {
        self.read(|d| d.own_sender_keys.get(group).map(|p| p.0.clone()))
    }

    fn store_own_sender_key(&self, group: &str, state: &SenderKeyState) -> StoreResult<()> {
        self.write(|d| {
            d.own_sender_keys
                .insert(group.to_string(), Packed(state.clone()));
        })
    }

    fn remove_own_sender_key(&self, group: &str) -> StoreResult<()> {
        self.write(|d| {
            d.own_sender_keys.remove(group);
            d.sender_key_recipients.remove(group);
        })
    }

    fn sender_key(
        &self,
        group: &str,
        sender: &DeviceAddress,
    ) -> StoreResult<Option<SenderKeyState>> {
        self.read(|d| {
            d.sender_keys
                .get(&sender_key_id(group, sender))
                .map(|p| p.0.clone())
        })
    }

    fn store_sender_key(
        &self,
        group: &str,
        sender: &DeviceAddress,
        state: &SenderKeyState,
    ) -> StoreResult<()> {
        self.write(|d| {
            d.sender_keys
                .insert(sender_key_id(group, sender), Packed(state.clone()));
        })
    }

    fn sender_key_recipients(&self, group: &str) -> StoreResult<BTreeSet<DeviceAddress>> {
        self.read(|d| {
            d.sender_key_recipients
                .get(group)
                .map(|set| set.iter().filter_map(|s| s.parse().ok()).collect())
                .unwrap_or_default()
        })
    }

    fn add_sender_key_recipients(
        &self,
        group: &str,
        devices: &[DeviceAddress],
    ) -> StoreResult<()> {
        self.write(|d| {
            d.sender_key_recipients
                .entry(group.to_string())
                .or_default()
                .extend(devices.iter().map(ToString::to_string));
        })
    }
}

/// Returns the default session store path.
pub fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parley")
        .join("sessions.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::crypto::IdentityKeyPair;
    use tempfile::TempDir;

    fn marker(one_time: u32) -> BundleMarker {
        BundleMarker {
            address: DeviceAddress::new("15551234567", 1),
            identity: "abcd".to_string(),
            one_time_prekey_id: one_time,
        }
    }

    #[test]
    fn test_one_time_prekeys() {
        let store = FileStore::in_memory();
        store
            .store_one_time_prekeys(OneTimePreKey::generate_batch(10, 3))
            .unwrap();
        assert_eq!(store.one_time_prekey_count().unwrap(), 3);
        assert_eq!(store.first_one_time_prekey().unwrap().unwrap().id, 10);
        assert!(store.remove_one_time_prekey(10).unwrap());
        assert!(!store.remove_one_time_prekey(10).unwrap());
        assert!(store.one_time_prekey(10).unwrap().is_none());
        assert!(store.one_time_prekey(11).unwrap().is_some());
    }

    #[test]
    fn test_bundle_markers() {
        let store = FileStore::in_memory();
        assert!(!store.is_bundle_consumed(&marker(4)).unwrap());
        store.mark_bundle_consumed(&marker(4)).unwrap();
        assert!(store.is_bundle_consumed(&marker(4)).unwrap());
        assert!(!store.is_bundle_consumed(&marker(5)).unwrap());

        let other_device = BundleMarker {
            address: DeviceAddress::new("15551234567", 2),
            ..marker(4)
        };
        assert!(!store.is_bundle_consumed(&other_device).unwrap());
    }

    #[test]
    fn test_bundle_markers_reset_on_new_identity() {
        let store = FileStore::in_memory();
        store.mark_bundle_consumed(&marker(4)).unwrap();

        let reinstalled = BundleMarker {
            identity: "ef01".to_string(),
            ..marker(7)
        };
        store.mark_bundle_consumed(&reinstalled).unwrap();
        assert!(store.is_bundle_consumed(&reinstalled).unwrap());
        assert!(!store.is_bundle_consumed(&marker(4)).unwrap());
    }

    #[test]
    fn test_bundle_markers_are_bounded_per_device() {
        let store = FileStore::in_memory();
        let total = MAX_CONSUMED_PREKEYS_PER_DEVICE as u32 + 10;
        for id in 0..total {
            store.mark_bundle_consumed(&marker(id)).unwrap();
        }

        let kept = store
            .read(|d| d.consumed_prekeys["15551234567.1"].ids.len())
            .unwrap();
        assert_eq!(kept, MAX_CONSUMED_PREKEYS_PER_DEVICE);
        assert!(!store.is_bundle_consumed(&marker(0)).unwrap());
        assert!(store.is_bundle_consumed(&marker(total - 1)).unwrap());
    }

    #[test]
    fn test_remote_identity() {
        let store = FileStore::in_memory();
        let address = DeviceAddress::new("a", 0);
        let identity = IdentityKeyPair::generate().public();
        assert!(store.remote_identity(&address).unwrap().is_none());
        store.save_remote_identity(&address, &identity).unwrap();
        assert_eq!(store.remote_identity(&address).unwrap(), Some(identity));
    }

    #[test]
    fn test_sender_key_recipients() {
        let store = FileStore::in_memory();
        let group = "120363025246125486@g.us";
        let devices = [DeviceAddress::new("a", 0), DeviceAddress::new("b", 3)];
        store.add_sender_key_recipients(group, &devices).unwrap();
        let recipients = store.sender_key_recipients(group).unwrap();
        assert_eq!(recipients.len(), 2);
        assert!(recipients.contains(&DeviceAddress::new("b", 3)));

        store
            .store_own_sender_key(group, &SenderKeyState::generate())
            .unwrap();
        store.remove_own_sender_key(group).unwrap();
        assert!(store.own_sender_key(group).unwrap().is_none());
        assert!(store.sender_key_recipients(group).unwrap().is_empty());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("sessions.json");

        let sender = DeviceAddress::new("15550001111", 2);
        let group = "123@g.us";
        let state = SenderKeyState::generate();
        {
            let store = FileStore::open(&path).unwrap();
            LocalIdentity::provision(&store, 42, 0, 2).unwrap();
            store.store_sender_key(group, &sender, &state).unwrap();
            store.mark_bundle_consumed(&marker(9)).unwrap();
        }

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.local_identity().unwrap().unwrap().registration_id, 42);
        assert_eq!(store.one_time_prekey_count().unwrap(), 2);
        assert_eq!(
            store.sender_key(group, &sender).unwrap().unwrap().key_id(),
            state.key_id()
        );
        assert!(store.is_bundle_consumed(&marker(9)).unwrap());
    }

    #[test]
    fn test_open_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_in_memory_has_no_path() {
        assert!(FileStore::in_memory().path().is_none());
    }
}
