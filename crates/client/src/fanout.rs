//! Device fan-out and envelope construction.
//!
//! One logical send becomes one encrypted envelope per target device.
//! For groups the builder can instead encrypt once with our sender key and
//! attach a single shared `skmsg`; devices that do not hold the sender key
//! yet get it through an individually encrypted envelope.
//!
//! ```text
//! <message to id type phash>
//!   <participants>
//!     <to jid="user:dev@server"><enc v="2" type="pkmsg|msg">..</enc></to>
//!     ...
//!   </participants>
//!   <enc v="2" type="skmsg">..</enc>          (sender-key path only)
//! </message>
//! ```
//!
//! A failure for one device never aborts the others; failures are
//! reported per device in [`Fanout::failures`].

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use futures_util::future::join_all;
use protocol::{
    BinaryNode, DeviceAddress, Envelope, EnvelopeKind, GroupSenderKey, Jid, MessagePayload,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SessionError};
use crate::signal::SessionRepository;

/// Default minimum device count for the sender-key path.
pub const DEFAULT_SENDER_KEY_THRESHOLD: usize = 2;

/// Version attribute of `enc` nodes.
pub const ENC_VERSION: &str = "2";

/// Application content of one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    /// Opaque payload.
    pub content: Vec<u8>,
}

impl LogicalMessage {
    /// Wraps a payload.
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Tunables of the builder; the `[fanout]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Group sends to at least this many devices use the sender-key path.
    pub sender_key_threshold: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            sender_key_threshold: DEFAULT_SENDER_KEY_THRESHOLD,
        }
    }
}

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Message id; generated when absent.
    pub message_id: Option<String>,
    /// Group the message belongs to.
    pub group: Option<Jid>,
    /// Extra attributes for the `message` node.
    pub additional_attributes: BTreeMap<String, String>,
    /// Extra children for the `message` node.
    pub additional_nodes: Vec<BinaryNode>,
    /// Restricts the send to one device, as a resend.
    pub participant: Option<DeviceAddress>,
    /// Resend counter placed on the `enc` node of a resend.
    pub retry_count: Option<u32>,
}

/// Encryption failure for one device.
#[derive(Debug)]
pub struct DeviceFailure {
    /// Device that was skipped.
    pub address: DeviceAddress,
    /// What went wrong.
    pub error: SessionError,
}

/// Devices handed our sender key by one fan-out.
///
/// Nothing is recorded until [`EnvelopeBuilder::commit`] runs, which the
/// caller does once the stanza carrying the distribution was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyDelivery {
    /// Group id.
    pub group: String,
    /// Id of the distributed sender key.
    pub key_id: u32,
    /// Devices that got an envelope carrying the key.
    pub devices: Vec<DeviceAddress>,
}

/// Result of fanning out one logical message.
#[derive(Debug)]
pub struct Fanout {
    /// Id shared by every per-device copy.
    pub message_id: String,
    /// One `to` node per device that received its own envelope.
    pub participants: Vec<BinaryNode>,
    /// Shared sender-key envelope, on the sender-key path.
    pub broadcast: Option<BinaryNode>,
    /// Devices that could not be encrypted for.
    pub failures: Vec<DeviceFailure>,
    /// Hash of the intended device list.
    pub phash: String,
    /// Sender-key recipients to record after sending.
    pub sender_key_delivery: Option<SenderKeyDelivery>,
}

impl Fanout {
    /// Wraps the envelopes into a `message` stanza for `to`.
    pub fn into_stanza(self, to: &Jid, msg_type: &str, options: &RelayOptions) -> BinaryNode {
        let mut attrs = options.additional_attributes.clone();
        attrs.insert("id".to_string(), self.message_id);
        attrs.insert("to".to_string(), to.to_string());
        attrs.insert("type".to_string(), msg_type.to_string());
        attrs.insert("phash".to_string(), self.phash);

        let mut children = Vec::new();
        if !self.participants.is_empty() {
            children.push(BinaryNode::new("participants").with_children(self.participants));
        }
        children.extend(self.broadcast);
        children.extend(options.additional_nodes.iter().cloned());

        BinaryNode::new("message")
            .with_attrs(attrs)
            .with_children(children)
    }
}

/// Builds per-device envelopes through the session repository.
#[derive(Clone)]
pub struct EnvelopeBuilder {
    repository: Arc<SessionRepository>,
    config: FanoutConfig,
}

impl EnvelopeBuilder {
    /// Creates a builder.
    pub fn new(repository: Arc<SessionRepository>, config: FanoutConfig) -> Self {
        Self { repository, config }
    }

    /// Session repository in use.
    pub fn repository(&self) -> &Arc<SessionRepository> {
        &self.repository
    }

    /// Encrypts `message` for every device in `targets`.
    ///
    /// Per-device failures are collected. An error is returned only when
    /// nothing could be produced at all, such as a failure of our own
    /// sender key.
    pub async fn build(
        &self,
        message: &LogicalMessage,
        targets: &[DeviceAddress],
        options: &RelayOptions,
    ) -> Result<Fanout> {
        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(generate_message_id);

        let targets: Vec<DeviceAddress> = match &options.participant {
            Some(participant) => vec![participant.clone()],
            None => targets.to_vec(),
        };
        let phash = participant_hash(&targets);
        let count = options
            .participant
            .as_ref()
            .map(|_| options.retry_count.unwrap_or(1));
        let content = MessagePayload::content(message.content.clone()).to_padded_bytes()?;

        let use_sender_key = options.participant.is_none()
            && targets.len() >= self.config.sender_key_threshold;
        let fanout = match &options.group {
            Some(group) if use_sender_key => {
                self.build_sender_key(message_id, group, &targets, &content, phash)
                    .await?
            }
            _ => {
                let (participants, failures) = self.encrypt_each(&targets, &content, count).await;
                Fanout {
                    message_id,
                    participants,
                    broadcast: None,
                    failures,
                    phash,
                    sender_key_delivery: None,
                }
            }
        };

        tracing::debug!(
            message_id = %fanout.message_id,
            devices = targets.len(),
            participants = fanout.participants.len(),
            broadcast = fanout.broadcast.is_some(),
            failures = fanout.failures.len(),
            "Built fan-out"
        );
        Ok(fanout)
    }

    /// Records the recipients of a sent sender-key distribution.
    pub async fn commit(&self, delivery: &SenderKeyDelivery) -> Result<()> {
        if delivery.devices.is_empty() {
            return Ok(());
        }
        let recorded = self
            .repository
            .commit_sender_key_delivery(&delivery.group, delivery.key_id, &delivery.devices)
            .await?;
        if recorded {
            tracing::info!(
                group = %delivery.group,
                devices = delivery.devices.len(),
                "Distributed sender key"
            );
        }
        Ok(())
    }

    async fn build_sender_key(
        &self,
        message_id: String,
        group: &Jid,
        targets: &[DeviceAddress],
        content: &[u8],
        phash: String,
    ) -> Result<Fanout> {
        let group_id = group.to_string();
        let (ciphertext, distribution) =
            self.repository.encrypt_group(&group_id, content).await?;
        let key_id = distribution.key_id;

        let holders = self.repository.sender_key_recipients(&group_id)?;
        let missing: Vec<DeviceAddress> = targets
            .iter()
            .filter(|address| !holders.contains(*address))
            .cloned()
            .collect();

        let (participants, failures) = if missing.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            let payload = MessagePayload {
                content: None,
                sender_key_distribution: Some(GroupSenderKey {
                    group: group_id.clone(),
                    distribution,
                }),
            }
            .to_padded_bytes()?;
            self.encrypt_each(&missing, &payload, None).await
        };

        let devices: Vec<DeviceAddress> = missing
            .into_iter()
            .filter(|address| !failures.iter().any(|f| &f.address == address))
            .collect();

        let broadcast = enc_node(&Envelope::new(EnvelopeKind::SenderKey, ciphertext), None);
        Ok(Fanout {
            message_id,
            participants,
            broadcast: Some(broadcast),
            failures,
            phash,
            sender_key_delivery: Some(SenderKeyDelivery {
                group: group_id,
                key_id,
                devices,
            }),
        })
    }

    /// Encrypts `plaintext` for each device concurrently.
    async fn encrypt_each(
        &self,
        targets: &[DeviceAddress],
        plaintext: &[u8],
        count: Option<u32>,
    ) -> (Vec<BinaryNode>, Vec<DeviceFailure>) {
        let results = join_all(targets.iter().map(|address| async move {
            let result = self.repository.encrypt(address, plaintext).await;
            (address, result)
        }))
        .await;

        let mut participants = Vec::new();
        let mut failures = Vec::new();
        for (address, result) in results {
            match result {
                Ok(envelope) => participants.push(
                    BinaryNode::new("to")
                        .with_attr("jid", address.to_jid().to_string())
                        .with_children(vec![enc_node(&envelope, count)]),
                ),
                Err(error) => {
                    tracing::warn!(address = %address, error = %error, "Skipping device");
                    failures.push(DeviceFailure {
                        address: address.clone(),
                        error,
                    });
                }
            }
        }
        (participants, failures)
    }
}

fn enc_node(envelope: &Envelope, count: Option<u32>) -> BinaryNode {
    let mut node = BinaryNode::new("enc")
        .with_attr("v", ENC_VERSION)
        .with_attr("type", envelope.kind.as_str());
    if let Some(count) = count {
        node = node.with_attr("count", count.to_string());
    }
    node.with_bytes(envelope.ciphertext.clone())
}

/// New random message id: `3EB0` followed by 36 upper-case hex digits.
pub fn generate_message_id() -> String {
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("3EB0{}", hex::encode_upper(bytes))
}

/// Hash of a device list, independent of its order.
///
/// `"2:"` followed by the base64 of the first 6 bytes of SHA-256 over the
/// sorted device JIDs.
pub fn participant_hash(devices: &[DeviceAddress]) -> String {
    let mut jids: Vec<String> = devices.iter().map(|d| d.to_jid().to_string()).collect();
    jids.sort();
    let digest = Sha256::digest(jids.concat().as_bytes());
    format!(
        "2:{}",
        base64::engine::general_purpose::STANDARD.encode(&digest[..6])
    )
}
