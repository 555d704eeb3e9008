//! WebSocket channel transport against a QRGate server
//!
//! Speaks the JSON protocol of `/ws/qr-auth`: [`ClientMessage`]s go up,
//! [`ChannelFrame`]s come down.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use qrgate_core::{ChannelEvent, ChannelFrame, ClientMessage, Error, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::transport::{ChannelConnection, ChannelConnector};

/// Opens connections to the channel endpoint of a server
#[derive(Debug, Clone)]
pub struct WsChannelConnector {
    url: String,
}

impl WsChannelConnector {
    /// Connector for the server at `base_url` (`http://` or `https://`)
    pub fn new(base_url: &str) -> Self {
        Self {
            url: channel_url(base_url),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn channel_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws/qr-auth", base)
}

#[async_trait]
impl ChannelConnector for WsChannelConnector {
    async fn connect(&self) -> Result<Box<dyn ChannelConnection>> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        debug!("Connected to {}", self.url);
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsConnection {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message).map_err(|e| Error::Protocol(e.to_string()))?;
        self.stream
            .send(Message::Text(json))
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }
}

#[async_trait]
impl ChannelConnection for WsConnection {
    async fn join(&mut self, token: &str, client_session_id: &str) -> Result<()> {
        self.send(&ClientMessage::JoinQrSession {
            token: token.to_string(),
            client_session_id: client_session_id.to_string(),
        })
        .await
    }

    async fn leave(&mut self, token: &str) -> Result<()> {
        self.send(&ClientMessage::LeaveQrSession {
            token: token.to_string(),
        })
        .await
    }

    async fn next_frame(&mut self) -> Option<ChannelFrame> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(match serde_json::from_str::<ChannelFrame>(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Invalid channel frame: {}", e);
                            ChannelFrame::connection(ChannelEvent::Error {
                                message: format!("Malformed frame: {}", e),
                            })
                        }
                    });
                }
                Ok(Message::Close(_)) => return None,
                // Pongs are queued by the stream itself
                Ok(_) => continue,
                Err(e) => {
                    debug!("Channel connection closed: {}", e);
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::tests::RecordingHost;
    use crate::handoff::PostAuthAction;
    use crate::handshake::{Handshake, HandshakeOptions, HandshakeOutcome};
    use crate::http::HttpSessionApi;
    use crate::state::HandshakeState;
    use qrgate_core::{Config, Credential};
    use qrgate_server::{create_router, AppState};
    use std::sync::Arc;

    /// Serve a fresh server on an ephemeral port; returns its base URL
    async fn serve(state: Arc<AppState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let router = create_router(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        base_url
    }

    #[test]
    fn test_channel_url() {
        assert_eq!(
            WsChannelConnector::new("http://127.0.0.1:3001/").url(),
            "ws://127.0.0.1:3001/ws/qr-auth"
        );
        assert_eq!(
            WsChannelConnector::new("https://login.example.com").url(),
            "wss://login.example.com/ws/qr-auth"
        );
    }

    #[tokio::test]
    async fn test_handshake_over_network() {
        let state = Arc::new(AppState::new(Config::default().with_redirect_delay_ms(0)));
        let base_url = serve(state.clone()).await;

        let host = Arc::new(RecordingHost::at("/login"));
        let (handshake, mut handle) = Handshake::new(
            Arc::new(HttpSessionApi::new(base_url.clone())),
            Arc::new(WsChannelConnector::new(&base_url)),
            host.clone(),
            HandshakeOptions::default(),
        );
        let driver = tokio::spawn(handshake.run());

        let view = handle
            .wait_for(|v| v.state == HandshakeState::Waiting)
            .await
            .unwrap();
        let token = view.token.unwrap();

        state.issuer.mark_scanned(&token).await.unwrap();
        state
            .issuer
            .complete_authentication(&token, Credential::new("xyz"))
            .await
            .unwrap();

        match driver.await.unwrap() {
            HandshakeOutcome::Authenticated(established) => {
                assert_eq!(established.attempt, 1);
                assert_eq!(
                    established.action,
                    PostAuthAction::Redirect("/".to_string())
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            host.sessions.lock().unwrap().as_slice(),
            &[Credential::new("xyz")]
        );
    }

    #[tokio::test]
    async fn test_join_with_foreign_client_id_is_refused() {
        let state = Arc::new(AppState::new(Config::default()));
        let base_url = serve(state.clone()).await;
        let grant = state.issuer.create_session("browser-a", "").await.unwrap();

        let connector = WsChannelConnector::new(&base_url);
        let mut conn = connector.connect().await.unwrap();
        conn.join(&grant.token, "browser-b").await.unwrap();

        let frame = conn.next_frame().await.unwrap();
        assert_eq!(frame.token.as_deref(), Some(grant.token.as_str()));
        assert!(matches!(frame.event, ChannelEvent::Error { .. }));
        assert_eq!(state.channel.subscriber_count(&grant.token), 0);
    }
}
