use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use super::ChannelError;

/// First sub-protocol token; identifies the stream protocol to the host.
pub const SUBPROTOCOL_MARKER: &str = "beach-sync";
/// Sent in the token slot when no bearer token is available.
pub const PLACEHOLDER_AUTH_TOKEN: &str = "PLACEHOLDER_AUTH_TOKEN";

/// Sub-protocol tokens in the order the host expects them.
pub fn subprotocols(token: Option<String>, resume_session_id: Option<&str>) -> Vec<String> {
    let mut protocols = vec![
        SUBPROTOCOL_MARKER.to_string(),
        token
            .filter(|token| !token.trim().is_empty())
            .unwrap_or_else(|| PLACEHOLDER_AUTH_TOKEN.to_string()),
    ];
    if let Some(session_id) = resume_session_id.filter(|id| !id.is_empty()) {
        protocols.push(session_id.to_string());
    }
    protocols
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

/// Fixed token (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider(Option<String>);

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// An open duplex stream. `inbound` yields `None` once the peer is gone;
/// dropping `outbound` closes the stream.
pub struct StreamConnection {
    pub outbound: mpsc::UnboundedSender<Bytes>,
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &Url, protocols: &[String])
    -> Result<StreamConnection, ChannelError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl StreamConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &Url,
        protocols: &[String],
    ) -> Result<StreamConnection, ChannelError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let header = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|err| ChannelError::Connect(format!("invalid sub-protocol token: {err}")))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", header);

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        debug!(
            target = "beach_sync::channel",
            url = %url,
            status = %response.status(),
            protocol = ?response.headers().get("Sec-WebSocket-Protocol"),
            "websocket opened"
        );

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(pump_websocket(ws_stream, outbound_rx, inbound_tx));
        Ok(StreamConnection { outbound, inbound })
    }
}

async fn pump_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    inbound: mpsc::UnboundedSender<Bytes>,
) {
    let (mut sink, mut stream) = ws_stream.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = sink.send(Message::Binary(frame.to_vec())).await {
                        warn!(target = "beach_sync::channel", error = %err, "websocket send failed");
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    if inbound.send(Bytes::from(data)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(Bytes::from(text.into_bytes())).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(target = "beach_sync::channel", ?frame, "websocket closed by peer");
                    break;
                }
                Some(Ok(_)) => trace!(target = "beach_sync::channel", "ignoring control frame"),
                Some(Err(err)) => {
                    warn!(target = "beach_sync::channel", error = %err, "websocket receive failed");
                    break;
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_ordered_marker_token_resume() {
        assert_eq!(
            subprotocols(Some("jwt".into()), Some("session-1")),
            vec!["beach-sync", "jwt", "session-1"]
        );
    }

    #[test]
    fn missing_token_uses_placeholder() {
        assert_eq!(
            subprotocols(None, None),
            vec![SUBPROTOCOL_MARKER, PLACEHOLDER_AUTH_TOKEN]
        );
        assert_eq!(
            subprotocols(Some("  ".into()), Some("")),
            vec![SUBPROTOCOL_MARKER, PLACEHOLDER_AUTH_TOKEN]
        );
    }
}
