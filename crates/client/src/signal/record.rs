//! Persisted per-device session records.

use std::collections::VecDeque;

use protocol::crypto::{RatchetState, KEY_LENGTH};
use serde::{Deserialize, Serialize};

/// Bootstrap information kept until the peer replies.
///
/// While set, every outbound message is sent as a `pkmsg` so the peer can
/// complete the agreement even if earlier messages were lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    /// One-time prekey consumed from the peer's bundle.
    pub prekey_id: Option<u32>,
    /// Signed prekey used from the peer's bundle.
    pub signed_prekey_id: u32,
    /// Our base key.
    pub base_key: [u8; KEY_LENGTH],
}

/// One ratchet session with a device, plus bootstrap bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Ratchet state.
    pub ratchet: RatchetState,
    /// Base key of the agreement that created this session.
    pub base_key: [u8; KEY_LENGTH],
    /// Registration id of the peer.
    pub remote_registration_id: u32,
    /// Present until the first message from the peer is accepted.
    pub pending_prekey: Option<PendingPreKey>,
}

/// Current session with a device and the states it replaced.
///
/// Archived states let messages that were in flight during a re-bootstrap
/// still decrypt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    archived: VecDeque<SessionState>,
}

impl SessionRecord {
    /// Record holding a single state.
    pub fn new(state: SessionState) -> Self {
        Self {
            current: Some(state),
            archived: VecDeque::new(),
        }
    }

    /// The active state, if any.
    pub fn current(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    /// Mutable access to the active state.
    pub fn current_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    /// Number of archived states.
    pub fn archived_len(&self) -> usize {
        self.archived.len()
    }

    /// Makes `state` current, archiving the previous one.
    ///
    /// At most `max_archived` old states are kept, newest first.
    pub fn promote(&mut self, state: SessionState, max_archived: usize) {
        if let Some(previous) = self.current.replace(state) {
            self.archived.push_front(previous);
        }
        self.archived.truncate(max_archived);
    }

    /// Makes the archived state at `index` current again.
    pub fn restore_archived(&mut self, index: usize, max_archived: usize) {
        if let Some(state) = self.archived.remove(index) {
            self.promote(state, max_archived);
        }
    }

    /// Overwrites the state at `slot`.
    pub fn set(&mut self, slot: StateSlot, state: SessionState) {
        match slot {
            StateSlot::Current => self.current = Some(state),
            StateSlot::Archived(index) => {
                if let Some(existing) = self.archived.get_mut(index) {
                    *existing = state;
                }
            }
        }
    }

    /// Archived states, newest first.
    pub fn archived(&self) -> impl Iterator<Item = &SessionState> {
        self.archived.iter()
    }

    /// Locates the state created by `base_key`.
    pub fn find_base_key(&self, base_key: &[u8; KEY_LENGTH]) -> Option<StateSlot> {
        if self.current.as_ref().is_some_and(|s| &s.base_key == base_key) {
            return Some(StateSlot::Current);
        }
        self.archived
            .iter()
            .position(|s| &s.base_key == base_key)
            .map(StateSlot::Archived)
    }

    /// State at `slot`.
    pub fn get(&self, slot: StateSlot) -> Option<&SessionState> {
        match slot {
            StateSlot::Current => self.current.as_ref(),
            StateSlot::Archived(index) => self.archived.get(index),
        }
    }
}

/// Position of a state inside a [`SessionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSlot {
    /// The active state.
    Current,
    /// An archived state, by index.
    Archived(usize),
}
