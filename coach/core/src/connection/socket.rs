//! Socket Abstraction
//!
//! The connection manager never touches a concrete protocol. A
//! [`SocketConnector`] opens a [`Socket`]; the manager drives it from a single
//! task, so a socket only needs `&mut self` methods.

use async_trait::async_trait;

use crate::error::TransportError;

/// An open, message-oriented connection
#[async_trait]
pub trait Socket: Send {
    /// Wait for the next text message; `Ok(None)` means the peer closed
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Send a text message
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a keep-alive ping
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection; errors are ignored
    async fn close(&mut self);
}

/// Opens sockets; called once per connection attempt
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a socket; returning `Ok` confirms the connection
    async fn connect(&self) -> Result<Box<dyn Socket>, TransportError>;
}
