//! High-level client for round-based sessions.
//!
//! [`RoundClient`] wires the [`EventDispatcher`], [`SessionStateMachine`],
//! [`ConnectionReliability`] and [`Coordinator`] together through a
//! [`ServiceRegistry`] and exposes the user intents as plain methods. UI code
//! reads state through [`RoundClient::session`] and listens on
//! [`RoundClient::events`].
//!
//! # Example
//!
//! ```rust,ignore
//! let connector = Arc::new(WebSocketConnector::new("ws://localhost:3536/ws"));
//! let identity = Arc::new(MemoryIdentityStore::new());
//! let mut client = RoundClient::start(ClientConfig::new(), connector, identity)?;
//!
//! let _sub = client.events().subscribe(names::PHASE_CHANGED, |event| {
//!     println!("{:?}", event.data);
//!     Ok(())
//! });
//!
//! client.join_room("ROOM42", "Alice");
//! // ...
//! client.shutdown().await;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::coordinator::{services, Coordinator};
use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::event::{EventData, UserIntent};
use crate::identity::{IdentityService, IdentityStore};
use crate::registry::{HealthStatus, RegisterOptions, Service, ServiceRegistry};
use crate::reliability::{BackoffPolicy, ConnectionReliability};
use crate::session::SessionStateMachine;
use crate::transport::{Connector, ConnectorService};

/// Default bound on a single connection attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default heartbeat interval.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`RoundClient`].
///
/// Every field has a default; use the `with_*` setters to tune them.
///
/// ```
/// use round_client::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new()
///     .with_heartbeat_interval(Duration::from_secs(10))
///     .with_max_reconnect_attempts(3);
/// assert_eq!(config.backoff().max_attempts, 3);
/// assert_eq!(config.connect_timeout, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on each connection attempt, including reconnects.
    ///
    /// Defaults to **10 seconds**.
    pub connect_timeout: Duration,
    /// Interval between heartbeat pings while connected.
    ///
    /// Defaults to **25 seconds**.
    pub heartbeat_interval: Duration,
    /// Delay before the first reconnect attempt; doubles on each attempt.
    ///
    /// Defaults to **1 second**.
    pub reconnect_base_delay: Duration,
    /// Upper bound on the reconnect delay.
    ///
    /// Defaults to **30 seconds**.
    pub reconnect_max_delay: Duration,
    /// Reconnect attempts before giving up.
    ///
    /// Defaults to **5**.
    pub max_reconnect_attempts: u32,
    /// Timeout for the graceful shutdown.
    ///
    /// Defaults to **1 second**. A zero timeout aborts the connection loop
    /// immediately without waiting for a graceful close.
    pub shutdown_timeout: Duration,
    /// Rejoin the stored room on startup and after every reconnect.
    ///
    /// Defaults to **true**.
    pub auto_rejoin: bool,
}

impl ClientConfig {
    pub fn new() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_base_delay: backoff.base_delay,
            reconnect_max_delay: backoff.max_delay,
            max_reconnect_attempts: backoff.max_attempts,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            auto_rejoin: true,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the first reconnect delay and the cap it doubles up to.
    #[must_use]
    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max.max(base);
        self
    }

    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_auto_rejoin(mut self, auto_rejoin: bool) -> Self {
        self.auto_rejoin = auto_rejoin;
        self
    }

    /// The reconnect schedule described by this configuration.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for ClientConfig {}

// ── Wiring ──────────────────────────────────────────────────────────

/// Register every client service in `registry` under the names in
/// [`services`].
///
/// Nothing is built until the coordinator is resolved.
pub fn register_services(
    registry: &ServiceRegistry,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    identity: Arc<dyn IdentityStore>,
) {
    let config = Arc::new(config);
    let connector = Arc::new(ConnectorService(connector));
    let identity = Arc::new(IdentityService(identity));

    registry
        .register(services::EVENTS, RegisterOptions::default(), |_, _| {
            Ok(Arc::new(EventDispatcher::new()))
        })
        .register(
            services::SESSION,
            RegisterOptions::default().with_dependencies([services::EVENTS]),
            |deps, _| {
                Ok(Arc::new(SessionStateMachine::new(
                    deps.get(services::EVENTS)?,
                )))
            },
        )
        .register(services::RELIABILITY, RegisterOptions::default(), |_, _| {
            Ok(Arc::new(ConnectionReliability::new()))
        })
        .register(services::CONFIG, RegisterOptions::default(), move |_, _| {
            Ok(Arc::clone(&config))
        })
        .register(services::CONNECTOR, RegisterOptions::default(), move |_, _| {
            Ok(Arc::clone(&connector))
        })
        .register(services::IDENTITY, RegisterOptions::default(), move |_, _| {
            Ok(Arc::clone(&identity))
        })
        .register(
            services::COORDINATOR,
            RegisterOptions::default().with_dependencies(services::COORDINATOR_DEPENDENCIES),
            |deps, _| Ok(Arc::new(Coordinator::from_dependencies(deps)?)),
        );
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to a running round session client.
///
/// Created via [`RoundClient::start`], which spawns the background
/// connection loop. The intent methods publish `user:*` events and return
/// immediately; rejected intents surface as `system:error` events.
pub struct RoundClient {
    registry: ServiceRegistry,
    events: Arc<EventDispatcher>,
    session: Arc<SessionStateMachine>,
    reliability: Arc<ConnectionReliability>,
    coordinator: Arc<Coordinator>,
    shutdown_timeout: Duration,
}

impl RoundClient {
    /// Build the service graph and start connecting.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Registry`](crate::ClientError::Registry) if the
    /// service graph cannot be built.
    pub fn start(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        identity: Arc<dyn IdentityStore>,
    ) -> Result<Self> {
        let shutdown_timeout = config.shutdown_timeout;
        let registry = ServiceRegistry::new();
        register_services(&registry, config, connector, identity);
        registry.validate()?;

        let coordinator = registry.get::<Coordinator>(services::COORDINATOR)?;
        let events = registry.get::<EventDispatcher>(services::EVENTS)?;
        let session = registry.get::<SessionStateMachine>(services::SESSION)?;
        let reliability = registry.get::<ConnectionReliability>(services::RELIABILITY)?;
        coordinator.start();

        Ok(Self {
            registry,
            events,
            session,
            reliability,
            coordinator,
            shutdown_timeout,
        })
    }

    // ── Intents ─────────────────────────────────────────────────────

    /// Join `room_id` as `player_name`, now or as soon as connected.
    pub fn join_room(&self, room_id: impl Into<String>, player_name: impl Into<String>) {
        self.publish_intent(UserIntent::JoinRoom {
            room_id: room_id.into(),
            player_name: player_name.into(),
        });
    }

    /// Leave the current room and forget the stored identity.
    pub fn leave_room(&self) {
        self.publish_intent(UserIntent::LeaveRoom);
    }

    pub fn start_round(&self) {
        self.publish_intent(UserIntent::StartRound);
    }

    pub fn submit_response(&self, text: impl Into<String>) {
        self.publish_intent(UserIntent::SubmitResponse { text: text.into() });
    }

    /// Guess the response at `index` in the session's response list.
    pub fn submit_guess(&self, index: usize) {
        self.publish_intent(UserIntent::SubmitGuess { index });
    }

    fn publish_intent(&self, intent: UserIntent) {
        let name = intent.event_name();
        let delivered = self
            .events
            .publish_from(name, EventData::Intent(intent), "client");
        if delivered == 0 {
            debug!(event = name, "RoundClient: intent had no subscribers");
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn session(&self) -> &Arc<SessionStateMachine> {
        &self.session
    }

    pub fn reliability(&self) -> &Arc<ConnectionReliability> {
        &self.reliability
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Returns `true` if a transport is currently connected.
    pub fn is_connected(&self) -> bool {
        self.coordinator.is_connected()
    }

    /// Health of every built service, by name.
    pub fn health(&self) -> BTreeMap<String, HealthStatus> {
        self.registry.health_status()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Gracefully close the connection and tear the services down.
    ///
    /// The connection loop gets the configured shutdown timeout to close the
    /// transport and publish a final `connection:disconnected`; after that
    /// it is aborted.
    pub async fn shutdown(&mut self) {
        debug!("RoundClient: shutdown requested");
        self.coordinator.shutdown(self.shutdown_timeout).await;
        self.registry.clear();
    }
}

impl Drop for RoundClient {
    fn drop(&mut self) {
        // No executor to drive a graceful close here; abort instead.
        self.coordinator.abort();
    }
}

impl std::fmt::Debug for RoundClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundClient")
            .field("coordinator", &self.coordinator)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::identity::MemoryIdentityStore;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A transport whose `close()` never completes.
    struct HangingCloseTransport {
        dropped: Arc<AtomicBool>,
    }

    impl Drop for HangingCloseTransport {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::Release);
        }
    }

    #[async_trait]
    impl Transport for HangingCloseTransport {
        async fn send(&mut self, _message: String) -> std::result::Result<(), ClientError> {
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, ClientError>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> std::result::Result<(), ClientError> {
            std::future::pending().await
        }
    }

    struct HangingCloseConnector {
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connector for HangingCloseConnector {
        async fn connect(&self) -> std::result::Result<Box<dyn Transport>, ClientError> {
            Ok(Box::new(HangingCloseTransport {
                dropped: Arc::clone(&self.dropped),
            }))
        }
    }

    #[test]
    fn config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert!(config.auto_rejoin);

        let backoff = config.backoff();
        assert_eq!(backoff.base_delay, Duration::from_secs(1));
        assert_eq!(backoff.max_delay, Duration::from_secs(30));
        assert_eq!(backoff.max_attempts, 5);
    }

    #[test]
    fn reconnect_cap_never_below_base() {
        let config = ClientConfig::new()
            .with_reconnect_delays(Duration::from_secs(5), Duration::from_secs(2));
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(5));
    }

    #[test]
    fn registry_validates_and_builds_lazily() {
        let registry = ServiceRegistry::new();
        let dropped = Arc::new(AtomicBool::new(false));
        register_services(
            &registry,
            ClientConfig::default(),
            Arc::new(HangingCloseConnector { dropped }),
            Arc::new(MemoryIdentityStore::new()),
        );
        registry.validate().unwrap();
        let health = registry.health_status();
        assert_eq!(health.len(), 7);
        assert!(health.values().all(|h| *h == HealthStatus::Unknown));

        let coordinator = registry.get::<Coordinator>(services::COORDINATOR).unwrap();
        assert!(!coordinator.is_running());
        assert_eq!(
            registry.check_health(services::SESSION).unwrap(),
            HealthStatus::Healthy
        );
        // Built but never started.
        assert_eq!(
            registry.check_health(services::COORDINATOR).unwrap(),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn shutdown_aborts_when_close_hangs() {
        let dropped = Arc::new(AtomicBool::new(false));
        let connector = Arc::new(HangingCloseConnector {
            dropped: Arc::clone(&dropped),
        });
        let config = ClientConfig::new().with_shutdown_timeout(Duration::from_millis(50));
        let mut client =
            RoundClient::start(config, connector, Arc::new(MemoryIdentityStore::new())).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !client.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("client should connect");

        tokio::time::timeout(Duration::from_secs(2), client.shutdown())
            .await
            .expect("shutdown should not hang");

        assert!(dropped.load(Ordering::Acquire));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn drop_aborts_connection_loop() {
        let dropped = Arc::new(AtomicBool::new(false));
        let connector = Arc::new(HangingCloseConnector {
            dropped: Arc::clone(&dropped),
        });
        let client = RoundClient::start(
            ClientConfig::new(),
            connector,
            Arc::new(MemoryIdentityStore::new()),
        )
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !client.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("client should connect");

        drop(client);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !dropped.load(Ordering::Acquire) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("transport should be dropped after abort");
    }
}
