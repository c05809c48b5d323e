//! WebSocket transport.
//!
//! Each binary WebSocket message carries one or more frame chunks. Text
//! messages are not part of the protocol and are ignored; ping and pong
//! are answered by `tungstenite` itself.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};

use super::{FrameReceiver, FrameSender};
use crate::error::TransportError;

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of a WebSocket.
pub struct WebSocketSender {
    sink: SplitSink<Stream, WsMessage>,
}

/// Inbound half of a WebSocket.
pub struct WebSocketReceiver {
    stream: SplitStream<Stream>,
}

/// Connects to `url` and splits the socket into its two halves.
pub async fn connect(
    url: &str,
    timeout: Duration,
) -> Result<(WebSocketSender, WebSocketReceiver), TransportError> {
    tracing::info!(url, "Connecting");
    let (socket, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| TransportError::ConnectTimeout(timeout))??;
    let (sink, stream) = socket.split();
    tracing::info!(url, "WebSocket connected");
    Ok((WebSocketSender { sink }, WebSocketReceiver { stream }))
}

impl FrameSender for WebSocketSender {
    fn send<'a>(
        &'a mut self,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.sink.send(WsMessage::Binary(bytes)).await?;
            Ok(())
        })
    }

    fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            match self.sink.close().await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

impl FrameReceiver for WebSocketReceiver {
    fn recv<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Vec<u8>, TransportError>>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await? {
                    Ok(WsMessage::Binary(bytes)) => return Some(Ok(bytes)),
                    Ok(WsMessage::Close(frame)) => {
                        tracing::debug!(?frame, "WebSocket closed by peer");
                        return None;
                    }
                    Ok(WsMessage::Text(_)) => {
                        tracing::debug!("Ignoring text message");
                    }
                    Ok(_) => {}
                    Err(WsError::ConnectionClosed) => return None,
                    Err(e) => return Some(Err(e.into())),
                }
            }
        })
    }
}
