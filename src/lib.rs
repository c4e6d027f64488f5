//! # Round Client
//!
//! Client-side core for round-based multiplayer sessions: players join a
//! room, answer a prompt, guess among everyone's responses and see results.
//!
//! The crate is split into small services wired through a [`ServiceRegistry`]:
//!
//! - [`EventDispatcher`]: named publish/subscribe bus shared by every component
//! - [`SessionStateMachine`]: canonical phase, round and submission state
//! - [`ConnectionReliability`]: connect timeout, heartbeat and backoff timers
//! - [`Coordinator`](coordinator::Coordinator): turns user intents into
//!   protocol messages and server frames into state transitions
//!
//! The wire is JSON text over any bidirectional [`Transport`]; a WebSocket
//! implementation ships behind the default `transport-websocket` feature.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "transport-websocket")]
//! # async fn run() -> round_client::error::Result<()> {
//! use std::sync::Arc;
//! use round_client::{names, ClientConfig, MemoryIdentityStore, RoundClient, WebSocketConnector};
//!
//! let connector = Arc::new(WebSocketConnector::new("ws://localhost:3536/ws"));
//! let mut client = RoundClient::start(
//!     ClientConfig::new(),
//!     connector,
//!     Arc::new(MemoryIdentityStore::new()),
//! )?;
//!
//! let _phases = client.events().subscribe(names::PHASE_CHANGED, |event| {
//!     println!("phase: {:?}", event.data);
//!     Ok(())
//! });
//!
//! client.join_room("ROOM42", "Alice");
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod reliability;
pub mod session;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{ClientConfig, RoundClient};
pub use dispatcher::{EventDispatcher, SubscribeOptions, Subscription};
pub use error::{ClientError, HandlerError};
pub use error_codes::ErrorCode;
pub use event::{names, Event, EventData, UserIntent};
pub use identity::{IdentityStore, MemoryIdentityStore, StoredIdentity};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{Service, ServiceRegistry};
pub use reliability::{BackoffPolicy, ConnectionReliability};
pub use session::{Phase, SessionState, SessionStateMachine};
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
