//! Decryption of inbound `message` stanzas.
//!
//! A stanza may carry several `enc` children: a direct envelope (which can
//! carry a sender-key distribution) followed by a group ciphertext. Direct
//! envelopes are processed first so the distribution is installed before
//! the group ciphertext that needs it. Each `enc` is decrypted on its own;
//! one failure never hides the other contents.

use std::sync::Arc;

use protocol::{
    BinaryNode, DeviceAddress, Envelope, EnvelopeKind, Jid, MessagePayload, ProtocolError,
};

use crate::error::SessionError;
use crate::signal::SessionRepository;

/// Failure of one `enc` child.
#[derive(Debug)]
pub struct EncFailure {
    /// Envelope type, if it was recognized.
    pub kind: Option<EnvelopeKind>,
    /// What went wrong.
    pub error: SessionError,
}

/// Plaintext recovered from one stanza.
#[derive(Debug)]
pub struct DecryptedMessage {
    /// Message id.
    pub id: String,
    /// Chat the message belongs to.
    pub from: Jid,
    /// Device that encrypted the message.
    pub sender: DeviceAddress,
    /// Group, for group messages.
    pub group: Option<Jid>,
    /// Application contents, in `enc` order.
    pub contents: Vec<Vec<u8>>,
    /// Per-envelope failures.
    pub failures: Vec<EncFailure>,
}

impl DecryptedMessage {
    /// True if every envelope decrypted.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs inbound stanzas through the session repository.
#[derive(Clone)]
pub struct MessageDecryptor {
    repository: Arc<SessionRepository>,
}

impl MessageDecryptor {
    /// Creates a decryptor.
    pub fn new(repository: Arc<SessionRepository>) -> Self {
        Self { repository }
    }

    /// Decrypts every `enc` child of a `message` stanza.
    ///
    /// Fails only when the stanza itself lacks routing attributes.
    pub async fn decrypt_node(&self, node: &BinaryNode) -> Result<DecryptedMessage, ProtocolError> {
        let id = node
            .attr("id")
            .ok_or_else(|| ProtocolError::malformed("message without id"))?
            .to_string();
        let from = node
            .attr("from")
            .and_then(Jid::parse)
            .ok_or_else(|| ProtocolError::malformed("message without valid from"))?;
        let (sender_jid, group) = match node.attr("participant") {
            Some(participant) => {
                let participant = Jid::parse(participant)
                    .ok_or_else(|| ProtocolError::malformed("invalid participant"))?;
                let group = (from.is_group() || from.is_broadcast()).then(|| from.clone());
                (participant, group)
            }
            None => (from.clone(), None),
        };
        let sender = DeviceAddress::from_jid(&sender_jid);

        let mut message = DecryptedMessage {
            id,
            from,
            sender,
            group,
            contents: Vec::new(),
            failures: Vec::new(),
        };

        let (direct, broadcast): (Vec<&BinaryNode>, Vec<&BinaryNode>) = node
            .children_by_tag("enc")
            .partition(|enc| enc.attr("type") != Some(EnvelopeKind::SenderKey.as_str()));
        for enc in direct.into_iter().chain(broadcast) {
            let kind = enc.attr("type").and_then(|t| t.parse::<EnvelopeKind>().ok());
            let result = self.decrypt_enc(&message, kind, enc).await;
            match result {
                Ok(Some(content)) => message.contents.push(content),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        id = %message.id,
                        sender = %message.sender,
                        kind = ?kind,
                        error = %error,
                        "Failed to decrypt envelope"
                    );
                    message.failures.push(EncFailure { kind, error });
                }
            }
        }
        Ok(message)
    }

    async fn decrypt_enc(
        &self,
        message: &DecryptedMessage,
        kind: Option<EnvelopeKind>,
        enc: &BinaryNode,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let sender = &message.sender;
        let malformed = |reason: &str| SessionError::MalformedEnvelope {
            address: sender.clone(),
            reason: reason.to_string(),
        };
        let kind = kind.ok_or_else(|| malformed("unknown envelope type"))?;
        let ciphertext = enc.bytes().ok_or_else(|| malformed("envelope without payload"))?;

        let padded = match kind {
            EnvelopeKind::SenderKey => {
                let group = message
                    .group
                    .as_ref()
                    .ok_or_else(|| malformed("group envelope outside a group"))?;
                self.repository
                    .decrypt_group(&group.to_string(), sender, ciphertext)
                    .await?
            }
            direct => {
                self.repository
                    .decrypt(sender, &Envelope::new(direct, ciphertext.to_vec()))
                    .await?
            }
        };
        let payload = MessagePayload::from_padded_bytes(&padded)
            .map_err(|e| SessionError::from_protocol(sender, e))?;

        if let Some(key) = payload.sender_key_distribution {
            let stanza_group = message.group.as_ref().map(Jid::to_string);
            if stanza_group.as_deref() == Some(key.group.as_str()) {
                self.repository
                    .process_sender_key_distribution(&key.group, sender, &key.distribution)
                    .await?;
            } else {
                tracing::warn!(
                    id = %message.id,
                    sender = %sender,
                    key_group = %key.group,
                    stanza_group = ?stanza_group,
                    "Ignoring sender key for another chat"
                );
            }
        }
        Ok(payload.content)
    }
}
