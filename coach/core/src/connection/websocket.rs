//! WebSocket socket (feature `websocket`)

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{Socket, SocketConnector};
use crate::error::TransportError;

/// Opens WebSocket connections to a fixed URL
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Connector for `url` (`ws://` or `wss://`)
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Target URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Socket>, TransportError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "WebSocket opened");
        Ok(Box::new(WsSocket { stream }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for WsSocket {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(frame) = self.stream.next().await {
            match frame.map_err(|e| TransportError::ConnectionLost(e.to_string()))? {
                WsMessage::Text(text) => return Ok(Some(text)),
                WsMessage::Binary(bytes) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
                }
                WsMessage::Close(_) => return Ok(None),
                // Pings are answered by tungstenite; pongs need no handling.
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
        Ok(None)
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::PingFailed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
