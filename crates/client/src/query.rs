//! Request/response correlation over a multiplexed connection.
//!
//! Every outbound query carries a unique `id` attribute. The server echoes
//! it on the response, which may arrive in any order relative to other
//! responses. [`QueryCorrelator`] keeps one single-use slot per pending id.
//!
//! Insertion, resolution and timeout eviction all happen under one lock, so
//! a response racing its timeout settles the query exactly once.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use parley::query::{QueryCorrelator, TagGenerator};
//! use protocol::BinaryNode;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let tags = TagGenerator::new();
//! let correlator = QueryCorrelator::new();
//!
//! let tag = tags.next();
//! let pending = correlator.register(&tag).unwrap();
//!
//! // The reader loop hands every inbound node to the correlator.
//! let response = BinaryNode::new("iq").with_attr("id", tag.as_str()).with_attr("type", "result");
//! assert!(correlator.resolve(response).is_none());
//!
//! let node = pending.wait(Duration::from_secs(5)).await.unwrap();
//! assert_eq!(node.attr("type"), Some("result"));
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use protocol::BinaryNode;
use rand::Rng;
use tokio::sync::oneshot;

use crate::error::{DisconnectReason, QueryError};

/// Attribute carrying the correlation tag.
pub const TAG_ATTR: &str = "id";

/// Produces correlation tags unique within one connection.
///
/// Tags are `"{epoch}{counter}"`, where the epoch prefix is random per
/// generator. Build a new generator for every connection.
#[derive(Debug)]
pub struct TagGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl TagGenerator {
    /// Creates a generator with a random epoch prefix.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let prefix = format!("{}.{}-", rng.gen::<u16>(), rng.gen::<u16>());
        Self::with_prefix(prefix)
    }

    /// Creates a generator with a fixed prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(1),
        }
    }

    /// Epoch prefix shared by all tags of this generator.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the next tag.
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

type Slot = oneshot::Sender<Result<BinaryNode, QueryError>>;

struct PendingQuery {
    created: Instant,
    slot: Slot,
}

#[derive(Default)]
struct PendingTable {
    queries: HashMap<String, PendingQuery>,
    closed: Option<DisconnectReason>,
}

/// Table of in-flight queries.
#[derive(Clone, Default)]
pub struct QueryCorrelator {
    inner: Arc<Mutex<PendingTable>>,
}

fn lock(table: &Mutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    // Every critical section leaves the table consistent.
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QueryCorrelator {
    /// Creates an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending query under `tag`.
    ///
    /// Fails if the tag is already pending or the correlator was closed by
    /// [`QueryCorrelator::fail_all`].
    pub fn register(&self, tag: &str) -> Result<PendingHandle, QueryError> {
        let mut table = lock(&self.inner);
        if let Some(reason) = table.closed {
            return Err(QueryError::ConnectionClosed(reason));
        }
        if table.queries.contains_key(tag) {
            return Err(QueryError::DuplicateTag(tag.to_string()));
        }
        let (slot, rx) = oneshot::channel();
        table.queries.insert(
            tag.to_string(),
            PendingQuery {
                created: Instant::now(),
                slot,
            },
        );
        tracing::trace!(tag, pending = table.queries.len(), "Registered query");

        Ok(PendingHandle {
            tag: tag.to_string(),
            rx,
            table: self.inner.clone(),
            settled: false,
        })
    }

    /// Delivers `node` to the query waiting for its tag.
    ///
    /// Returns the node back when no query is waiting for it.
    pub fn resolve(&self, node: BinaryNode) -> Option<BinaryNode> {
        let Some(tag) = node.attr(TAG_ATTR).map(str::to_string) else {
            return Some(node);
        };
        let mut table = lock(&self.inner);
        let Some(pending) = table.queries.remove(&tag) else {
            return Some(node);
        };
        tracing::debug!(
            tag = %tag,
            elapsed_ms = pending.created.elapsed().as_millis() as u64,
            "Resolved query"
        );
        if pending.slot.send(Ok(node)).is_err() {
            tracing::debug!(tag = %tag, "Query caller went away before its response");
        }
        None
    }

    /// Fails every pending query with `ConnectionClosed(reason)`.
    ///
    /// Later registrations fail the same way.
    pub fn fail_all(&self, reason: DisconnectReason) {
        let mut table = lock(&self.inner);
        table.closed = Some(reason);
        let failed = table.queries.len();
        for (_, pending) in table.queries.drain() {
            let _ = pending.slot.send(Err(QueryError::ConnectionClosed(reason)));
        }
        if failed > 0 {
            tracing::info!(failed, reason = %reason, "Failed pending queries");
        }
    }

    /// Number of pending queries.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner).queries.len()
    }

    /// True if a query with `tag` is pending.
    pub fn contains(&self, tag: &str) -> bool {
        lock(&self.inner).queries.contains_key(tag)
    }
}

/// Caller side of one pending query.
///
/// Dropping the handle without waiting releases the slot.
pub struct PendingHandle {
    tag: String,
    rx: oneshot::Receiver<Result<BinaryNode, QueryError>>,
    table: Arc<Mutex<PendingTable>>,
    settled: bool,
}

impl PendingHandle {
    /// Correlation tag of this query.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Waits for the response, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<BinaryNode, QueryError> {
        let outcome = tokio::time::timeout(timeout, &mut self.rx).await;
        self.settled = true;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QueryError::ConnectionClosed(
                DisconnectReason::ConnectionClosed,
            )),
            Err(_) => {
                let evicted = lock(&self.table).queries.remove(&self.tag).is_some();
                if evicted {
                    tracing::warn!(tag = %self.tag, ?timeout, "Query timed out");
                    return Err(QueryError::Timeout {
                        tag: self.tag.clone(),
                        timeout,
                    });
                }
                // Resolved between the timer firing and the eviction.
                self.rx.try_recv().unwrap_or_else(|_| {
                    Err(QueryError::Timeout {
                        tag: self.tag.clone(),
                        timeout,
                    })
                })
            }
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if !self.settled && lock(&self.table).queries.remove(&self.tag).is_some() {
            tracing::debug!(tag = %self.tag, "Abandoned query released");
        }
    }
}

/// Turns a response of type `error` into [`QueryError::Server`].
///
/// The error details come from an `<error code text>` child.
pub fn check_response(node: BinaryNode) -> Result<BinaryNode, QueryError> {
    if node.attr("type") != Some("error") {
        return Ok(node);
    }
    let error = node.child("error");
    let code = error
        .and_then(|e| e.attr("code"))
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let text = error
        .and_then(|e| e.attr("text"))
        .unwrap_or("unknown error")
        .to_string();
    Err(QueryError::Server { code, text })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(tag: &str) -> BinaryNode {
        BinaryNode::new("iq")
            .with_attr("id", tag)
            .with_attr("type", "result")
    }

    #[test]
    fn test_tag_generator_unique() {
        let tags = TagGenerator::with_prefix("1.2-");
        assert_eq!(tags.next(), "1.2-1");
        assert_eq!(tags.next(), "1.2-2");

        let other = TagGenerator::new();
        assert!(other.prefix().ends_with('-'));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(other.next()));
        }
    }

    #[tokio::test]
    async fn test_reverse_order_responses() {
        let correlator = QueryCorrelator::new();
        let first = correlator.register("a").unwrap();
        let second = correlator.register("b").unwrap();

        let waiter_a = tokio::spawn(first.wait(Duration::from_secs(5)));
        let waiter_b = tokio::spawn(second.wait(Duration::from_secs(5)));

        assert!(correlator
            .resolve(response("b").with_attr("from", "second"))
            .is_none());
        assert!(correlator
            .resolve(response("a").with_attr("from", "first"))
            .is_none());

        let a = waiter_a.await.unwrap().unwrap();
        let b = waiter_b.await.unwrap().unwrap();
        assert_eq!(a.attr("from"), Some("first"));
        assert_eq!(b.attr("from"), Some("second"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let correlator = QueryCorrelator::new();
        let pending = correlator.register("slow").unwrap();
        assert!(correlator.contains("slow"));

        let err = pending.wait(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, QueryError::Timeout { ref tag, .. } if tag == "slow"));
        assert!(!correlator.contains("slow"));

        // A late response is no longer claimed by anyone.
        assert!(correlator.resolve(response("slow")).is_some());
    }

    #[tokio::test]
    async fn test_fail_all_on_disconnect() {
        let correlator = QueryCorrelator::new();
        let handles: Vec<_> = (0..3)
            .map(|i| correlator.register(&format!("q{i}")).unwrap())
            .collect();

        correlator.fail_all(DisconnectReason::ConnectionLost);
        assert_eq!(correlator.pending_count(), 0);
        for handle in handles {
            let err = handle.wait(Duration::from_secs(60)).await.unwrap_err();
            assert!(matches!(
                err,
                QueryError::ConnectionClosed(DisconnectReason::ConnectionLost)
            ));
        }

        assert!(matches!(
            correlator.register("late"),
            Err(QueryError::ConnectionClosed(DisconnectReason::ConnectionLost))
        ));
    }

    #[tokio::test]
    async fn test_response_before_wait() {
        let correlator = QueryCorrelator::new();
        let pending = correlator.register("fast").unwrap();
        assert!(correlator.resolve(response("fast")).is_none());
        let node = pending.wait(Duration::ZERO).await.unwrap();
        assert_eq!(node.attr("id"), Some("fast"));
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let correlator = QueryCorrelator::new();
        let _pending = correlator.register("dup").unwrap();
        assert!(matches!(
            correlator.register("dup"),
            Err(QueryError::DuplicateTag(_))
        ));
    }

    #[test]
    fn test_dropped_handle_releases_slot() {
        let correlator = QueryCorrelator::new();
        let pending = correlator.register("gone").unwrap();
        drop(pending);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_unmatched_nodes_returned() {
        let correlator = QueryCorrelator::new();
        let node = BinaryNode::new("message").with_attr("id", "x");
        assert_eq!(correlator.resolve(node.clone()), Some(node));
        let untagged = BinaryNode::new("notification");
        assert!(correlator.resolve(untagged).is_some());
    }

    #[test]
    fn test_check_response_maps_server_error() {
        let ok = response("1");
        assert!(check_response(ok).is_ok());

        let error = BinaryNode::new("iq")
            .with_attr("id", "2")
            .with_attr("type", "error")
            .with_children(vec![BinaryNode::new("error")
                .with_attr("code", "404")
                .with_attr("text", "item-not-found")]);
        match check_response(error) {
            Err(QueryError::Server { code, text }) => {
                assert_eq!(code, 404);
                assert_eq!(text, "item-not-found");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
