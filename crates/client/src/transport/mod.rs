//! Byte transports carrying framed nodes.
//!
//! The connection treats the transport as two halves: a [`FrameSender`]
//! that accepts encoded frames and a [`FrameReceiver`] that yields raw
//! chunks in order. Chunk boundaries need not match frame boundaries; the
//! connection reassembles frames itself.
//!
//! Implementations:
//!
//! - [`memory`] - linked in-memory endpoints for tests and local relays
//! - [`websocket`] - binary WebSocket messages via `tokio-tungstenite`

pub mod memory;
pub mod websocket;

use std::future::Future;
use std::pin::Pin;

use crate::error::TransportError;

/// Outbound half of a transport.
pub trait FrameSender: Send {
    /// Sends one chunk of bytes.
    fn send<'a>(
        &'a mut self,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// Closes the outbound half.
    fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;
}

/// Inbound half of a transport.
pub trait FrameReceiver: Send {
    /// Receives the next chunk.
    ///
    /// Returns `None` once the peer has closed the transport.
    fn recv<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Vec<u8>, TransportError>>> + Send + 'a>>;
}
