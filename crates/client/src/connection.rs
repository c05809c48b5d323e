//! Connection context.
//!
//! A [`Connection`] owns one transport and everything scoped to it: the tag
//! generator, the query correlator and the background tasks. The reader
//! task reassembles frames, answers pending queries, decrypts inbound
//! messages and forwards everything else to the caller. Tearing the
//! connection down fails every pending query at once; the session store is
//! left untouched so a new connection resumes with the same sessions.
//!
//! ```text
//! transport ──► NodeStream ──► correlator ──► decryptor ──► InboundEvent
//!                                  ▲
//! query() ──► tag ──► register ────┘──► encode ──► transport
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::binary::jid::USER_SERVER;
use protocol::{BinaryNode, Decoded, DeviceAddress, FrameDecoder, Jid, NodeCodec, NodeStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{DisconnectReason, Error, QueryError, Result, TransportError};
use crate::fanout::{DeviceFailure, EnvelopeBuilder, FanoutConfig, LogicalMessage, RelayOptions};
use crate::inbound::{DecryptedMessage, MessageDecryptor};
use crate::query::{check_response, QueryCorrelator, TagGenerator, TAG_ATTR};
use crate::signal::SessionRepository;
use crate::transport::{FrameReceiver, FrameSender};

/// Capacity of the inbound event queue.
const INBOUND_CAPACITY: usize = 256;

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 16;

/// Runtime settings of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Default query timeout.
    pub query_timeout: Duration,
    /// Keepalive ping interval; `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Node codec for both directions.
    pub codec: NodeCodec,
    /// Fan-out tunables.
    pub fanout: FanoutConfig,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ConnectionOptions {
    /// Options described by `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            query_timeout: config.connection.query_timeout(),
            keepalive_interval: config.connection.keepalive_interval(),
            codec: config.codec.node_codec(),
            fanout: config.fanout,
        }
    }
}

/// Lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection is ready.
    Opened,
    /// The connection ended.
    Closed(DisconnectReason),
}

/// Inbound traffic not consumed by a pending query.
#[derive(Debug)]
pub enum InboundEvent {
    /// A node delivered as-is.
    Node(BinaryNode),
    /// A `message` stanza after decryption.
    Message(DecryptedMessage),
}

/// Outcome of [`Connection::relay_message`].
#[derive(Debug)]
pub struct RelayReport {
    /// Id of the relayed message.
    pub message_id: String,
    /// Devices able to decrypt the message.
    pub delivered: usize,
    /// Devices that were skipped.
    pub failures: Vec<DeviceFailure>,
    /// False when no device could be encrypted for and nothing was sent.
    pub sent: bool,
}

struct Shared {
    sender: tokio::sync::Mutex<Box<dyn FrameSender>>,
    tags: TagGenerator,
    correlator: QueryCorrelator,
    options: ConnectionOptions,
    builder: EnvelopeBuilder,
    decryptor: MessageDecryptor,
    events: broadcast::Sender<ConnectionEvent>,
    first_events: Mutex<Option<broadcast::Receiver<ConnectionEvent>>>,
    shutdown: CancellationToken,
    open: AtomicBool,
}

/// Handle to an open connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Starts a connection over an established transport.
    ///
    /// Spawns the reader task and, when configured, the keepalive task.
    /// Must be called from within a tokio runtime.
    ///
    /// The returned receiver should be drained continuously. The reader
    /// never waits on it: while it is full, further inbound events are
    /// logged and dropped so query responses keep flowing.
    pub fn open(
        options: ConnectionOptions,
        sender: Box<dyn FrameSender>,
        receiver: Box<dyn FrameReceiver>,
        repository: Arc<SessionRepository>,
    ) -> (Connection, mpsc::Receiver<InboundEvent>) {
        let (events, first_events) = broadcast::channel(EVENT_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let shared = Arc::new(Shared {
            sender: tokio::sync::Mutex::new(sender),
            tags: TagGenerator::new(),
            correlator: QueryCorrelator::new(),
            builder: EnvelopeBuilder::new(repository.clone(), options.fanout),
            decryptor: MessageDecryptor::new(repository),
            options,
            events,
            first_events: Mutex::new(Some(first_events)),
            shutdown: CancellationToken::new(),
            open: AtomicBool::new(true),
        });
        let connection = Connection { shared };

        tokio::spawn(read_loop(connection.clone(), receiver, inbound_tx));
        if let Some(interval) = connection.shared.options.keepalive_interval {
            tokio::spawn(keepalive_loop(connection.clone(), interval));
        }

        let _ = connection.shared.events.send(ConnectionEvent::Opened);
        info!(prefix = connection.shared.tags.prefix(), "Connection opened");
        (connection, inbound_rx)
    }

    /// Subscribes to lifecycle events.
    ///
    /// The first subscriber also observes [`ConnectionEvent::Opened`].
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        let first = self
            .shared
            .first_events
            .lock()
            .ok()
            .and_then(|mut first| first.take());
        first.unwrap_or_else(|| self.shared.events.subscribe())
    }

    /// True until the connection is closed.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Number of queries awaiting a response.
    pub fn pending_queries(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    /// New tag unique within this connection.
    pub fn generate_tag(&self) -> String {
        self.shared.tags.next()
    }

    /// Encodes and sends one node.
    pub async fn send_node(&self, node: &BinaryNode) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::Closed.into());
        }
        let frame = self.shared.options.codec.encode_frame(node)?;
        self.shared.sender.lock().await.send(frame).await?;
        debug!(tag = %node.tag, id = node.attr(TAG_ATTR), "Sent node");
        Ok(())
    }

    /// Sends `node` and waits for its response using the default timeout.
    pub async fn query(&self, node: BinaryNode) -> std::result::Result<BinaryNode, QueryError> {
        self.query_with_timeout(node, self.shared.options.query_timeout)
            .await
    }

    /// Sends `node` and waits up to `timeout` for its response.
    ///
    /// A fresh tag is assigned when the node has none. Responses of type
    /// `error` fail with [`QueryError::Server`].
    pub async fn query_with_timeout(
        &self,
        node: BinaryNode,
        timeout: Duration,
    ) -> std::result::Result<BinaryNode, QueryError> {
        let node = match node.attr(TAG_ATTR) {
            Some(_) => node,
            None => {
                let tag = self.generate_tag();
                node.with_attr(TAG_ATTR, tag)
            }
        };
        let tag = node.attr(TAG_ATTR).unwrap_or_default().to_string();

        // Registered before sending so a fast response cannot be missed
        let pending = self.shared.correlator.register(&tag)?;
        if let Err(err) = self.send_node(&node).await {
            return Err(match err {
                Error::Protocol(err) => QueryError::Codec(err),
                Error::Transport(TransportError::Closed) if !self.is_open() => {
                    QueryError::ConnectionClosed(DisconnectReason::ConnectionClosed)
                }
                other => QueryError::Send(other.to_string()),
            });
        }
        check_response(pending.wait(timeout).await?)
    }

    /// Encrypts `message` for `targets` and sends one `message` stanza.
    ///
    /// Devices that cannot be encrypted for are reported and skipped.
    pub async fn relay_message(
        &self,
        to: &Jid,
        msg_type: &str,
        message: &LogicalMessage,
        targets: &[DeviceAddress],
        options: &RelayOptions,
    ) -> Result<RelayReport> {
        let mut fanout = self.shared.builder.build(message, targets, options).await?;
        let attempted = if options.participant.is_some() {
            1
        } else {
            targets.len()
        };
        let delivered = attempted.saturating_sub(fanout.failures.len());
        let sent = !fanout.participants.is_empty() || fanout.broadcast.is_some();

        let message_id = fanout.message_id.clone();
        let failures = std::mem::take(&mut fanout.failures);
        let delivery = fanout.sender_key_delivery.take();
        if sent {
            let stanza = fanout.into_stanza(to, msg_type, options);
            self.send_node(&stanza).await?;
            if let Some(delivery) = delivery {
                self.shared.builder.commit(&delivery).await?;
            }
            info!(
                message_id = %message_id,
                to = %to,
                delivered,
                failed = failures.len(),
                "Relayed message"
            );
        } else {
            warn!(message_id = %message_id, to = %to, "No device could be encrypted for");
        }

        Ok(RelayReport {
            message_id,
            delivered,
            failures,
            sent,
        })
    }

    /// Closes the connection.
    ///
    /// Pending queries fail with `ConnectionClosed(reason)`. Closing twice
    /// is a no-op.
    pub async fn close(&self, reason: DisconnectReason) {
        shutdown(&self.shared, reason).await;
    }
}

async fn shutdown(shared: &Shared, reason: DisconnectReason) {
    if !shared.open.swap(false, Ordering::SeqCst) {
        return;
    }
    info!(reason = %reason, "Closing connection");
    shared.shutdown.cancel();
    shared.correlator.fail_all(reason);
    if let Err(err) = shared.sender.lock().await.close().await {
        debug!(error = %err, "Transport close failed");
    }
    let _ = shared.events.send(ConnectionEvent::Closed(reason));
}

async fn read_loop(
    connection: Connection,
    mut receiver: Box<dyn FrameReceiver>,
    inbound: mpsc::Sender<InboundEvent>,
) {
    let shared = &connection.shared;
    let mut stream = NodeStream::new(FrameDecoder::new(), shared.options.codec.clone());

    let reason = loop {
        let chunk = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            chunk = receiver.recv() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => stream.push(&chunk),
            Some(Err(err)) => {
                warn!(error = %err, "Transport failed");
                break DisconnectReason::ConnectionLost;
            }
            None => break DisconnectReason::ConnectionClosed,
        }
        if let Some(reason) = drain(&connection, &mut stream, &inbound).await {
            break reason;
        }
    };
    shutdown(shared, reason).await;
}

/// Routes every complete node buffered in `stream`.
///
/// Returns a reason when the connection must end.
async fn drain(
    connection: &Connection,
    stream: &mut NodeStream,
    inbound: &mpsc::Sender<InboundEvent>,
) -> Option<DisconnectReason> {
    loop {
        match stream.next_node() {
            Ok(None) => return None,
            Ok(Some(Decoded::Dropped(err))) => {
                warn!(error = %err, "Dropped malformed node");
            }
            Ok(Some(Decoded::Node(node))) => {
                if let Some(reason) = route(connection, node, inbound).await {
                    return Some(reason);
                }
            }
            Err(err) => {
                warn!(error = %err, "Corrupt framing");
                return Some(DisconnectReason::ConnectionLost);
            }
        }
    }
}

async fn route(
    connection: &Connection,
    node: BinaryNode,
    inbound: &mpsc::Sender<InboundEvent>,
) -> Option<DisconnectReason> {
    match node.tag.as_str() {
        "xmlstreamend" => return Some(DisconnectReason::ConnectionClosed),
        "stream:error" => return Some(stream_error_reason(&node)),
        _ => {}
    }

    let node = connection.shared.correlator.resolve(node)?;
    let event = if node.tag == "message" && node.child("enc").is_some() {
        match connection.shared.decryptor.decrypt_node(&node).await {
            Ok(message) => InboundEvent::Message(message),
            Err(err) => {
                warn!(error = %err, "Undecryptable message stanza");
                InboundEvent::Node(node)
            }
        }
    } else {
        InboundEvent::Node(node)
    };

    match inbound.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            let kind = match &event {
                InboundEvent::Node(node) => node.tag.as_str(),
                InboundEvent::Message(_) => "message",
            };
            warn!(kind, "Inbound queue full, dropping event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => debug!("Inbound receiver dropped"),
    }
    None
}

/// Maps a `stream:error` node to a disconnect reason.
fn stream_error_reason(node: &BinaryNode) -> DisconnectReason {
    if let Some(code) = node.attr("code").and_then(|c| c.parse::<u16>().ok()) {
        return DisconnectReason::from_code(code);
    }
    if node.child("conflict").is_some() {
        return DisconnectReason::ConnectionReplaced;
    }
    DisconnectReason::BadSession
}

/// Ping node sent by the keepalive task.
pub fn keepalive_node() -> BinaryNode {
    BinaryNode::new("iq")
        .with_attr("type", "get")
        .with_attr("xmlns", "w:p")
        .with_attr("to", USER_SERVER)
        .with_children(vec![BinaryNode::new("ping")])
}

async fn keepalive_loop(connection: Connection, interval: Duration) {
    let shutdown = connection.shared.shutdown.clone();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match connection.query(keepalive_node()).await {
            Ok(_) | Err(QueryError::Server { .. }) => debug!("Keepalive acknowledged"),
            Err(QueryError::Timeout { .. }) => {
                warn!("Keepalive timed out");
                connection.close(DisconnectReason::ConnectionLost).await;
                return;
            }
            Err(QueryError::ConnectionClosed(_)) => return,
            Err(err) => warn!(error = %err, "Keepalive failed"),
        }
    }
}
