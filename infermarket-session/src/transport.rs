//! Transport seam between the engine and a compute host.
//!
//! A [`Connector`] opens a [`Transport`] to a host endpoint. Transports move
//! whole [`Frame`]s; framing, reconnect and backoff are theirs to handle. The
//! `websocket` feature provides [`ws::WsConnector`], which carries frames as
//! JSON text messages.

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::Frame;
use crate::types::HostEndpoint;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("transport closed: {0}")]
    Closed(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// A bidirectional frame pipe to one host.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Next inbound frame, or `None` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports to host endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &HostEndpoint) -> Result<Box<dyn Transport>, TransportError>;
}

#[cfg(feature = "websocket")]
pub mod ws {
    //! WebSocket transport over `tokio-tungstenite`.

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use super::{Connector, Transport, TransportError};
    use crate::envelope::Frame;
    use crate::types::HostEndpoint;

    #[derive(Debug, Default, Clone)]
    pub struct WsConnector;

    #[async_trait]
    impl Connector for WsConnector {
        async fn connect(&self, endpoint: &HostEndpoint) -> Result<Box<dyn Transport>, TransportError> {
            let (stream, _response) = connect_async(endpoint.as_str()).await.map_err(|e| {
                TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                }
            })?;
            tracing::debug!(endpoint = %endpoint, "websocket connected");
            Ok(Box::new(WsTransport { stream }))
        }
    }

    pub struct WsTransport {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    #[async_trait]
    impl Transport for WsTransport {
        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            let text = frame
                .to_json()
                .map_err(|e| TransportError::Malformed(e.to_string()))?;
            self.stream
                .send(Message::Text(text))
                .await
                .map_err(|e| TransportError::Send(e.to_string()))
        }

        async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
            while let Some(message) = self.stream.next().await {
                match message.map_err(|e| TransportError::Closed(e.to_string()))? {
                    Message::Text(text) => {
                        return Frame::from_json(&text)
                            .map(Some)
                            .map_err(|e| TransportError::Malformed(e.to_string()));
                    }
                    Message::Binary(bytes) => {
                        return serde_json::from_slice(&bytes)
                            .map(Some)
                            .map_err(|e| TransportError::Malformed(e.to_string()));
                    }
                    Message::Ping(data) => {
                        let _ = self.stream.send(Message::Pong(data)).await;
                    }
                    Message::Close(_) => return Ok(None),
                    Message::Pong(_) | Message::Frame(_) => {}
                }
            }
            Ok(None)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.stream
                .close(None)
                .await
                .map_err(|e| TransportError::Closed(e.to_string()))
        }
    }
}
