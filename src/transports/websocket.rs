//! WebSocket connections via `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] dials a fixed URL on every attempt and hands the
//! client a [`WebSocketTransport`]. `wss://` works out of the box through
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! Only available with the `transport-websocket` feature (on by default).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::error::ClientError;
use crate::transport::{Connector, Transport};

/// The stream type produced by [`tokio_tungstenite::connect_async`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dials `url` on every connection attempt.
///
/// Extra handshake headers (an auth token, a session cookie) are sent with
/// each attempt.
///
/// ```rust,no_run
/// # async fn example() -> Result<(), round_client::ClientError> {
/// use std::sync::Arc;
/// use round_client::{ClientConfig, MemoryIdentityStore, RoundClient, WebSocketConnector};
///
/// let connector = WebSocketConnector::new("ws://localhost:3000/ws")
///     .with_header("authorization", "Bearer abc123");
/// let client = RoundClient::start(
///     ClientConfig::new(),
///     Arc::new(connector),
///     Arc::new(MemoryIdentityStore::new()),
/// )?;
/// client.join_room("ROOM42", "Alice");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    headers: Vec<(String, String)>,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Add a header to the opening handshake.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn dial(&self) -> Result<WsStream, ClientError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(handshake_error)?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::Connect(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::Connect(format!("header {name}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(handshake_error)?;
        tracing::debug!(url = %self.url, status = %response.status(), "websocket handshake done");
        Ok(stream)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError> {
        let stream = self.dial().await?;
        tracing::info!(url = %self.url, "websocket connected");
        Ok(Box::new(WebSocketTransport::from_stream(stream)))
    }
}

/// I/O failures keep their kind; everything else is a connect error.
fn handshake_error(err: WsError) -> ClientError {
    match err {
        WsError::Io(io) => ClientError::Io(io),
        other => ClientError::Connect(other.to_string()),
    }
}

/// A [`Transport`] over one WebSocket connection.
///
/// `recv` only awaits `StreamExt::next`, so it is cancel-safe.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Wrap a stream opened elsewhere, e.g. with custom TLS settings.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

/// What one incoming WebSocket message means to the client.
enum Incoming {
    Text(String),
    End,
    Skip,
}

impl From<Message> for Incoming {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Self::Text(text.to_string()),
            Message::Close(frame) => {
                tracing::debug!(?frame, "server closed the websocket");
                Self::End
            }
            // tungstenite answers pings on its own.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Self::Skip,
            Message::Binary(bytes) => {
                tracing::warn!(len = bytes.len(), "ignoring binary websocket frame");
                Self::Skip
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| ClientError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, ClientError>> {
        while let Some(next) = self.stream.next().await {
            let msg = match next {
                Ok(msg) => msg,
                Err(e) => return Some(Err(ClientError::TransportReceive(e.to_string()))),
            };
            match Incoming::from(msg) {
                Incoming::Text(text) => return Some(Ok(text)),
                Incoming::End => return None,
                Incoming::Skip => {}
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ClientError::TransportSend(e.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    type ServerStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Accept one websocket connection on a local port and hand it to `serve`.
    async fn local_server<F, Fut>(serve: F) -> String
    where
        F: FnOnce(ServerStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            serve(tokio_tungstenite::accept_async(tcp).await.unwrap()).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn malformed_url_is_a_connect_error() {
        let err = WebSocketConnector::new("definitely not a url")
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Connect(_)), "{err:?}");
    }

    #[tokio::test]
    async fn refused_port_keeps_io_kind() {
        let err = WebSocketConnector::new("ws://127.0.0.1:1")
            .connect()
            .await
            .err()
            .unwrap();
        let ClientError::Io(io) = err else {
            panic!("expected Io, got {err:?}");
        };
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn invalid_header_is_rejected_before_dialing() {
        let err = WebSocketConnector::new("ws://127.0.0.1:1")
            .with_header("bad header", "x")
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Connect(_)), "{err:?}");
    }

    #[tokio::test]
    async fn handshake_carries_extra_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let inspect = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let token = req
                    .headers()
                    .get("x-room-token")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let _ = seen_tx.send(token);
                Ok(resp)
            };
            let _ws = tokio_tungstenite::accept_hdr_async(tcp, inspect)
                .await
                .unwrap();
        });

        WebSocketConnector::new(url)
            .with_header("x-room-token", "t0k3n")
            .connect()
            .await
            .unwrap();
        assert_eq!(seen_rx.await.unwrap().as_deref(), Some("t0k3n"));
    }

    #[tokio::test]
    async fn text_frames_flow_both_ways() {
        let url = local_server(|mut ws| async move {
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(format!("echo:{text}").into()))
                    .await
                    .unwrap();
            }
        })
        .await;

        let mut transport = WebSocketConnector::new(url).connect().await.unwrap();
        transport.send(r#"{"type":"ping"}"#.into()).await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            r#"echo:{"type":"ping"}"#
        );
    }

    #[tokio::test]
    async fn binary_frames_are_skipped_and_close_ends_the_stream() {
        let url = local_server(|mut ws| async move {
            ws.send(Message::Binary(vec![1, 2, 3].into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"type":"pong"}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketConnector::new(url).connect().await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            r#"{"type":"pong"}"#
        );
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_transport_refuses_sends() {
        let url = local_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
            .await;

        let mut transport = WebSocketConnector::new(url).connect().await.unwrap();
        transport.close().await.unwrap();
        // Second close is a no-op.
        transport.close().await.unwrap();
        let err = transport.send("late".into()).await.unwrap_err();
        assert!(matches!(err, ClientError::TransportClosed));
    }
}
