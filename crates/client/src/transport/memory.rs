//! In-memory transport.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use super::{FrameReceiver, FrameSender};
use crate::error::TransportError;

/// Sending end of an in-memory link.
#[derive(Debug)]
pub struct MemorySender {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Receiving end of an in-memory link.
#[derive(Debug)]
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// One side of a linked pair.
#[derive(Debug)]
pub struct MemoryEndpoint {
    /// Bytes sent here arrive at the other endpoint.
    pub sender: MemorySender,
    /// Bytes sent by the other endpoint.
    pub receiver: MemoryReceiver,
}

/// Creates two linked endpoints.
pub fn pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryEndpoint {
            sender: MemorySender { tx: Some(a_tx) },
            receiver: MemoryReceiver { rx: b_rx },
        },
        MemoryEndpoint {
            sender: MemorySender { tx: Some(b_tx) },
            receiver: MemoryReceiver { rx: a_rx },
        },
    )
}

impl MemorySender {
    fn send_now(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(bytes)
            .map_err(|_| TransportError::Closed)
    }
}

impl FrameSender for MemorySender {
    fn send<'a>(
        &'a mut self,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        let result = self.send_now(bytes);
        Box::pin(async move { result })
    }

    fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        self.tx = None;
        Box::pin(async { Ok(()) })
    }
}

impl FrameReceiver for MemoryReceiver {
    fn recv<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Vec<u8>, TransportError>>> + Send + 'a>> {
        Box::pin(async move { self.rx.recv().await.map(Ok) })
    }
}
