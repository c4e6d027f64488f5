//! The wire seam between the client and a round server.
//!
//! A [`Transport`] moves whole JSON text frames in both directions over one
//! live connection. Framing (WebSocket messages, length prefixes, ...) is the
//! implementation's business.
//!
//! The client never builds transports itself. It owns a [`Connector`] and
//! asks it for a fresh transport at startup and after every drop, so
//! reconnection works the same for any wire.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use round_client::error::ClientError;
//! use round_client::transport::{Connector, Transport};
//! use tokio::sync::mpsc;
//!
//! struct ChannelTransport {
//!     out: mpsc::UnboundedSender<String>,
//!     inbox: mpsc::UnboundedReceiver<String>,
//! }
//!
//! #[async_trait]
//! impl Transport for ChannelTransport {
//!     async fn send(&mut self, frame: String) -> Result<(), ClientError> {
//!         self.out
//!             .send(frame)
//!             .map_err(|e| ClientError::TransportSend(e.to_string()))
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, ClientError>> {
//!         self.inbox.recv().await.map(Ok)
//!     }
//!
//!     async fn close(&mut self) -> Result<(), ClientError> {
//!         self.inbox.close();
//!         Ok(())
//!     }
//! }
//!
//! struct Offline;
//!
//! #[async_trait]
//! impl Connector for Offline {
//!     async fn connect(&self) -> Result<Box<dyn Transport>, ClientError> {
//!         Err(ClientError::Connect("no network in this example".into()))
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::registry::Service;

/// One live, already-open connection carrying JSON text frames.
///
/// Held as `Box<dyn Transport>` by the connection loop.
///
/// `recv` is raced against commands and shutdown in `tokio::select!`, so a
/// cancelled `recv` must not drop a frame. Awaiting a channel receiver or a
/// `Stream::next` satisfies this.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Write one frame.
    ///
    /// # Errors
    ///
    /// [`ClientError::TransportSend`] when the frame cannot be written, or
    /// [`ClientError::TransportClosed`] after [`close`](Transport::close).
    async fn send(&mut self, frame: String) -> Result<(), ClientError>;

    /// Wait for the next frame.
    ///
    /// `None` means the server hung up cleanly; `Some(Err(_))` means the
    /// connection broke. Either way the client treats the connection as lost.
    async fn recv(&mut self) -> Option<Result<String, ClientError>>;

    /// Hang up. Resources must be released even when the goodbye fails.
    ///
    /// # Errors
    ///
    /// Whatever the close handshake reports.
    async fn close(&mut self) -> Result<(), ClientError>;
}

/// Opens new [`Transport`] connections.
///
/// Called once at startup and once per reconnection attempt. The client
/// bounds each call with its connect timeout, so implementations need not.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] (or any other variant) if the
    /// connection cannot be established.
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError>;
}

/// Registry wrapper so a connector can be wired like any other service.
pub struct ConnectorService(pub Arc<dyn Connector>);

impl Service for ConnectorService {}
