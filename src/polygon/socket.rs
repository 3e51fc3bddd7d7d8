// =============================================================================
// Polygon WebSocket — authenticated trade feed session
// =============================================================================
//
// Handshake: server sends `[{"ev":"status","status":"connected"}]`, client
// sends `{"action":"auth","params":"<key>"}`, server answers `auth_success`
// or `auth_failed`. Subscriptions are `{"action":"subscribe","params":"T.A,T.B"}`.
// Every data frame is a JSON array of events.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::market_data::stream::{StreamConnector, StreamSession};

pub const DEFAULT_STREAM_URL: &str = "wss://socket.polygon.io/stocks";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens authenticated sessions against a Polygon cluster endpoint.
#[derive(Clone)]
pub struct PolygonConnector {
    url: String,
    api_key: String,
    handshake_timeout: Duration,
}

impl PolygonConnector {
    /// `handshake_timeout` bounds the WebSocket upgrade and the auth
    /// exchange together.
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            handshake_timeout,
        }
    }

    async fn open_session(&self) -> Result<PolygonSession, StreamError> {
        let (ws, _response) = connect_async(self.url.as_str()).await?;
        let mut session = PolygonSession { ws, open: true };
        session.authenticate(&self.api_key).await?;
        Ok(session)
    }
}

impl std::fmt::Debug for PolygonConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolygonConnector")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

#[async_trait]
impl StreamConnector for PolygonConnector {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, StreamError> {
        info!(url = %self.url, "connecting to trade WebSocket");
        let session = tokio::time::timeout(self.handshake_timeout, self.open_session())
            .await
            .map_err(|_| {
                StreamError::Connection(format!(
                    "handshake timed out after {:?}",
                    self.handshake_timeout
                ))
            })??;
        info!("trade WebSocket authenticated");
        Ok(Box::new(session))
    }
}

pub struct PolygonSession {
    ws: WsStream,
    open: bool,
}

impl PolygonSession {
    async fn authenticate(&mut self, api_key: &str) -> Result<(), StreamError> {
        let auth = serde_json::json!({ "action": "auth", "params": api_key });
        self.ws.send(Message::Text(auth.to_string())).await?;

        loop {
            let Some(text) = self.next_text().await? else {
                return Err(StreamError::Connection(
                    "server closed the connection during authentication".into(),
                ));
            };
            if let Some(outcome) = auth_outcome(&text) {
                return outcome;
            }
        }
    }

    /// Next text frame, skipping control and binary frames. `None` once the
    /// server closes.
    async fn next_text(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "server sent close frame");
                    self.open = false;
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.open = false;
                    return Err(e.into());
                }
                None => {
                    self.open = false;
                    return Ok(None);
                }
            }
        }
    }
}

#[async_trait]
impl StreamSession for PolygonSession {
    async fn subscribe(&mut self, channels: &[String]) -> Result<(), StreamError> {
        if !self.open {
            return Err(StreamError::Closed);
        }
        let msg = subscribe_message(channels);
        self.ws.send(Message::Text(msg)).await?;
        debug!(channels = %channels.join(","), "subscribe sent");
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, StreamError> {
        if !self.open {
            return Ok(None);
        }
        self.next_text().await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        match self.ws.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// -----------------------------------------------------------------------------
// Control messages
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatusEvent {
    ev: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub fn subscribe_message(channels: &[String]) -> String {
    serde_json::json!({ "action": "subscribe", "params": channels.join(",") }).to_string()
}

/// `Some` once a frame settles authentication, `None` for unrelated frames.
fn auth_outcome(text: &str) -> Option<Result<(), StreamError>> {
    let events: Vec<StatusEvent> = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unexpected frame during authentication");
            return None;
        }
    };
    for ev in events.into_iter().filter(|e| e.ev == "status") {
        match ev.status.as_deref() {
            Some("auth_success") => return Some(Ok(())),
            Some("auth_failed") => {
                return Some(Err(StreamError::Connection(format!(
                    "authentication failed: {}",
                    ev.message.unwrap_or_default()
                ))))
            }
            other => debug!(status = ?other, message = ?ev.message, "status during handshake"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_message_joins_channels() {
        let msg = subscribe_message(&["T.AAPL".to_string(), "T.MSFT".to_string()]);
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["action"], "subscribe");
        assert_eq!(v["params"], "T.AAPL,T.MSFT");
    }

    #[test]
    fn handshake_frames_are_classified() {
        assert!(auth_outcome(r#"[{"ev":"status","status":"connected","message":"Connected Successfully"}]"#).is_none());
        assert!(matches!(
            auth_outcome(r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#),
            Some(Ok(()))
        ));
        assert!(matches!(
            auth_outcome(r#"[{"ev":"status","status":"auth_failed","message":"authentication failed"}]"#),
            Some(Err(StreamError::Connection(_)))
        ));
        assert!(auth_outcome("not json").is_none());
    }

    #[test]
    fn debug_redacts_key() {
        let c = PolygonConnector::new(DEFAULT_STREAM_URL, "k-123", Duration::from_secs(5));
        assert!(!format!("{c:?}").contains("k-123"));
    }

    #[tokio::test]
    async fn silent_server_times_out_the_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the socket without ever answering the upgrade.
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let connector = PolygonConnector::new(
            format!("ws://{addr}/stocks"),
            "k-123",
            Duration::from_millis(200),
        );
        let err = match connector.connect().await {
            Ok(_) => panic!("handshake against a silent server succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, StreamError::Connection(ref m) if m.contains("timed out")));
        server.abort();
    }
}
