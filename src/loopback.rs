//! In-process transport and collaborators for demo mode
//!
//! Connects the client handshake straight to the issuer and the realtime
//! channel of a local `AppState`, and stands in for the mobile app and the
//! host page.

use async_trait::async_trait;
use qrgate_auth::{token_fingerprint, IssuerResult, SessionIssuer};
use qrgate_client::{
    ChannelConnection, ChannelConnector, HostSession, PostAuthAction, SessionApi, Severity,
    SsoBridge,
};
use qrgate_core::protocol::{CreateSessionRequest, CreateSessionResponse};
use qrgate_core::{ChannelFrame, Credential, Error};
use qrgate_server::{Outbound, RealtimeChannel, Subscription};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Creates sessions by calling the issuer directly
pub struct LocalSessionApi {
    issuer: SessionIssuer,
}

impl LocalSessionApi {
    pub fn new(issuer: SessionIssuer) -> Self {
        Self { issuer }
    }
}

#[async_trait]
impl SessionApi for LocalSessionApi {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> qrgate_core::Result<CreateSessionResponse> {
        let grant = self
            .issuer
            .create_session(&request.client_session_id, &request.device_metadata)
            .await?;
        Ok(grant.into())
    }
}

/// Opens connections on a local realtime channel
///
/// Joins are checked against the issuer's subscriber binding, the same as
/// over the WebSocket endpoint.
pub struct LocalConnector {
    issuer: SessionIssuer,
    channel: RealtimeChannel,
}

impl LocalConnector {
    pub fn new(issuer: SessionIssuer, channel: RealtimeChannel) -> Self {
        Self { issuer, channel }
    }
}

#[async_trait]
impl ChannelConnector for LocalConnector {
    async fn connect(&self) -> qrgate_core::Result<Box<dyn ChannelConnection>> {
        let (outbound, inbound) = mpsc::unbounded_channel();
        Ok(Box::new(LocalConnection {
            issuer: self.issuer.clone(),
            channel: self.channel.clone(),
            outbound,
            inbound,
            joined: HashMap::new(),
        }))
    }
}

struct LocalConnection {
    issuer: SessionIssuer,
    channel: RealtimeChannel,
    outbound: Outbound,
    inbound: mpsc::UnboundedReceiver<ChannelFrame>,
    joined: HashMap<String, Subscription>,
}

#[async_trait]
impl ChannelConnection for LocalConnection {
    async fn join(&mut self, token: &str, client_session_id: &str) -> qrgate_core::Result<()> {
        self.issuer
            .authorize_subscriber(token, client_session_id)
            .await?;
        let subscription = self.channel.subscribe(token, self.outbound.clone());
        self.joined.insert(token.to_string(), subscription);
        Ok(())
    }

    async fn leave(&mut self, token: &str) -> qrgate_core::Result<()> {
        // Dropping the subscription releases it
        self.joined.remove(token);
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<ChannelFrame> {
        self.inbound.recv().await
    }
}

/// Plays the companion app: scans a code and approves the login
pub struct SimulatedDevice {
    issuer: SessionIssuer,
    think_time: Duration,
}

impl SimulatedDevice {
    pub fn new(issuer: SessionIssuer, think_time: Duration) -> Self {
        Self { issuer, think_time }
    }

    pub async fn approve(&self, token: &str, credential: Credential) -> IssuerResult<()> {
        tokio::time::sleep(self.think_time).await;
        self.issuer.mark_scanned(token).await?;
        info!("Device scanned {}", token_fingerprint(token));

        tokio::time::sleep(self.think_time).await;
        self.issuer.complete_authentication(token, credential).await
    }
}

/// Host page that logs what a browser would do
pub struct TerminalHost {
    path: String,
    session: Mutex<Option<Credential>>,
}

impl TerminalHost {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            session: Mutex::new(None),
        }
    }

    /// Credential of the established session
    pub fn session(&self) -> Option<Credential> {
        self.session.lock().ok().and_then(|s| s.clone())
    }
}

impl HostSession for TerminalHost {
    fn establish_session(&self, credential: &Credential) {
        info!(
            "Session established ({})",
            token_fingerprint(&credential.token)
        );
        if let Ok(mut session) = self.session.lock() {
            *session = Some(credential.clone());
        }
    }

    fn notify_user(&self, message_key: &str, severity: Severity) {
        match severity {
            Severity::Warning | Severity::Danger => warn!("[{}]", message_key),
            Severity::Info | Severity::Success => info!("[{}]", message_key),
        }
    }

    fn current_path(&self) -> String {
        self.path.clone()
    }

    fn navigate(&self, action: PostAuthAction) {
        match action {
            PostAuthAction::Redirect(to) => info!("Redirecting to {}", to),
            PostAuthAction::Reload => info!("Reloading {}", self.path),
        }
    }
}

/// Bridge of a page that is not running inside the companion app
pub struct DetachedBridge;

impl SsoBridge for DetachedBridge {
    fn is_available(&self) -> bool {
        false
    }

    fn post_message(&self, _message: &str) -> Result<(), String> {
        debug!("Dropping bridge message, no app attached");
        Err(Error::Connection("no app bridge".to_string()).to_string())
    }
}
