//! Authoritative QR session store
//!
//! All transitions for all tokens are serialized behind one write lock. The
//! issuer publishes each committed transition to its sink before releasing
//! the lock, so subscribers observe transitions in commit order.

use crate::code;
use crate::session::QrSession;
use crate::token::{generate_token, token_fingerprint};
use chrono::{DateTime, Utc};
use qrgate_core::protocol::{CreateSessionResponse, StatusResponse};
use qrgate_core::{ChannelEvent, Config, Credential, EventSink, SessionStatus, StatusUpdate};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Issuer errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IssuerError {
    #[error("Session not found")]
    NotFound,
    #[error("Session is in terminal state {0}")]
    TerminalState(SessionStatus),
    #[error("Session already completed")]
    AlreadyCompleted,
    #[error("Credential is malformed")]
    InvalidCredential,
    #[error("Issuer capacity exhausted: {0}")]
    Resource(String),
}

pub type IssuerResult<T> = Result<T, IssuerError>;

impl From<IssuerError> for qrgate_core::Error {
    fn from(err: IssuerError) -> Self {
        match err {
            IssuerError::NotFound => qrgate_core::Error::NotFound,
            IssuerError::TerminalState(_) => qrgate_core::Error::TerminalState,
            IssuerError::AlreadyCompleted => qrgate_core::Error::AlreadyCompleted,
            IssuerError::InvalidCredential => {
                qrgate_core::Error::Auth("credential is malformed".to_string())
            }
            IssuerError::Resource(_) => qrgate_core::Error::Resource,
        }
    }
}

/// Outcome of an idempotent operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changed and an event was published
    Applied,
    /// The call was a duplicate; nothing changed
    Unchanged,
}

/// Issuer settings
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Session lifetime
    pub ttl: Duration,
    /// How long terminal sessions are retained
    pub gc_grace: Duration,
    /// Maximum live sessions
    pub max_sessions: usize,
    /// Server-side rotations of an unscanned session before it expires
    pub max_rotations: u32,
    /// Server URL embedded in the code
    pub public_url: String,
    /// URI scheme embedded in the code
    pub uri_scheme: String,
    /// Rendered code size in pixels
    pub code_size: u32,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for IssuerConfig {
    fn from(config: &Config) -> Self {
        Self {
            ttl: config.session_ttl(),
            gc_grace: config.gc_grace(),
            max_sessions: config.max_sessions,
            max_rotations: config.max_rotations,
            public_url: config.public_url.clone(),
            uri_scheme: config.uri_scheme.clone(),
            code_size: config.qr_size,
        }
    }
}

/// Result of creating or refreshing a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionGrant {
    /// The new session token
    pub token: String,
    /// Payload encoded in the QR code
    pub login_uri: String,
    /// `data:` URL of the rendered code
    pub renderable_code: String,
    /// When the session expires
    pub expires_at: DateTime<Utc>,
    /// Seconds until expiry
    pub expires_in: u64,
}

impl From<SessionGrant> for CreateSessionResponse {
    fn from(grant: SessionGrant) -> Self {
        Self {
            token: grant.token,
            renderable_code: grant.renderable_code,
            expires_in: grant.expires_in,
        }
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_in: u64,
    pub subscriber: String,
    pub rotations: u32,
    /// Token that superseded this one on refresh
    pub replaced_by: Option<String>,
}

impl From<&SessionSnapshot> for StatusResponse {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            status: snapshot.status,
            expires_in: snapshot.expires_in,
            replaced_by: snapshot.replaced_by.clone(),
        }
    }
}

struct Inner {
    /// Live and recently terminated sessions by token
    sessions: RwLock<HashMap<String, QrSession>>,
    /// Transition subscriber
    sink: Arc<dyn EventSink>,
    config: IssuerConfig,
}

/// Issues QR sessions and drives their state machine
#[derive(Clone)]
pub struct SessionIssuer {
    inner: Arc<Inner>,
}

impl SessionIssuer {
    /// Create a new issuer publishing into `sink`
    pub fn new(config: IssuerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                sink,
                config,
            }),
        }
    }

    pub fn config(&self) -> &IssuerConfig {
        &self.inner.config
    }

    /// Create a new pending session bound to `client_session_id`
    pub async fn create_session(
        &self,
        client_session_id: &str,
        device_metadata: &str,
    ) -> IssuerResult<SessionGrant> {
        let mut sessions = self.inner.sessions.write().await;

        let grace = self.inner.config.gc_grace;
        sessions.retain(|_, s| !s.is_collectable(grace));

        let live = sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .count();
        if live >= self.inner.config.max_sessions {
            warn!("Refusing new QR session: {} live sessions", live);
            return Err(IssuerError::Resource(format!("{} live sessions", live)));
        }

        let grant = self.insert_session(
            &mut sessions,
            client_session_id.to_string(),
            device_metadata.to_string(),
            0,
        )?;

        info!(
            "Created QR session {} for {}",
            token_fingerprint(&grant.token),
            client_session_id
        );
        Ok(grant)
    }

    /// Record that the companion app scanned the code
    ///
    /// Repeated scans of a scanned session are no-ops.
    pub async fn mark_scanned(&self, token: &str) -> IssuerResult<Transition> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions.get_mut(token).ok_or(IssuerError::NotFound)?;
        self.expire_if_overdue(session);

        match session.status {
            SessionStatus::Scanned => {
                debug!("Duplicate scan for {}", token_fingerprint(token));
                Ok(Transition::Unchanged)
            }
            SessionStatus::Pending => {
                session.advance(SessionStatus::Scanned);
                self.inner
                    .sink
                    .publish(token, ChannelEvent::status(StatusUpdate::Scanned));
                info!("QR session {} scanned", token_fingerprint(token));
                Ok(Transition::Applied)
            }
            status => Err(IssuerError::TerminalState(status)),
        }
    }

    /// Authenticate the session and hand the credential to the channel
    ///
    /// The credential is published once and not retained.
    ///
    /// Only the first completion is accepted.
    pub async fn complete_authentication(
        &self,
        token: &str,
        credential: Credential,
    ) -> IssuerResult<()> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions.get_mut(token).ok_or(IssuerError::NotFound)?;
        self.expire_if_overdue(session);

        match session.status {
            SessionStatus::Authenticated => {
                warn!(
                    "Rejected second completion for {}",
                    token_fingerprint(token)
                );
                return Err(IssuerError::AlreadyCompleted);
            }
            status if status.is_terminal() => return Err(IssuerError::TerminalState(status)),
            _ => {}
        }

        if !credential.is_well_formed() {
            warn!(
                "Rejected malformed credential for {}",
                token_fingerprint(token)
            );
            return Err(IssuerError::InvalidCredential);
        }

        session.advance(SessionStatus::Authenticated);
        self.inner
            .sink
            .publish(token, ChannelEvent::auth_success(credential));

        info!("QR session {} authenticated", token_fingerprint(token));
        Ok(())
    }

    /// Cancel a session; idempotent once terminal
    pub async fn cancel(&self, token: &str) -> IssuerResult<Transition> {
        self.terminate(token, SessionStatus::Cancelled).await
    }

    /// Expire a session; idempotent once terminal
    pub async fn expire(&self, token: &str) -> IssuerResult<Transition> {
        self.terminate(token, SessionStatus::Expired).await
    }

    /// Replace a live session with a fresh one for the same subscriber
    ///
    /// The replacement exists before the old token is expired. The old
    /// token's channel gets `qr-code-refreshed` followed by an `expired`
    /// status update.
    pub async fn refresh(&self, token: &str) -> IssuerResult<SessionGrant> {
        let mut sessions = self.inner.sessions.write().await;
        self.refresh_locked(&mut sessions, token)
    }

    /// Current view of a session
    pub async fn status(&self, token: &str) -> IssuerResult<SessionSnapshot> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions.get_mut(token).ok_or(IssuerError::NotFound)?;
        self.expire_if_overdue(session);

        Ok(SessionSnapshot {
            status: session.status,
            created_at: session.created_at,
            expires_at: session.expires_at,
            expires_in: session.expires_in(),
            subscriber: session.subscriber.clone(),
            rotations: session.rotations,
            replaced_by: session.replaced_by.clone(),
        })
    }

    /// Check that `client_session_id` is the subscriber the session is bound to
    ///
    /// A mismatch reports `NotFound` so that a foreign caller learns nothing
    /// about which tokens exist.
    pub async fn authorize_subscriber(
        &self,
        token: &str,
        client_session_id: &str,
    ) -> IssuerResult<()> {
        let sessions = self.inner.sessions.read().await;
        let session = sessions.get(token).ok_or(IssuerError::NotFound)?;
        if session.subscriber != client_session_id {
            warn!(
                "Refused subscriber for {} bound to another client",
                token_fingerprint(token)
            );
            return Err(IssuerError::NotFound);
        }
        Ok(())
    }

    /// Login URI for a live session, used to render images on demand
    pub async fn login_uri(&self, token: &str) -> IssuerResult<String> {
        let sessions = self.inner.sessions.read().await;
        let session = sessions.get(token).ok_or(IssuerError::NotFound)?;
        if session.status.is_terminal() {
            return Err(IssuerError::TerminalState(session.status));
        }
        Ok(self.uri_for(token))
    }

    /// Render the code of a live session as a `data:` URL
    pub async fn render_code(&self, token: &str) -> IssuerResult<String> {
        let uri = self.login_uri(token).await?;
        code::render_data_url(&uri, self.inner.config.code_size).map_err(IssuerError::Resource)
    }

    /// Number of non-terminal sessions
    pub async fn live_sessions(&self) -> usize {
        let sessions = self.inner.sessions.read().await;
        sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .count()
    }

    /// Drop terminal sessions past their grace period
    pub async fn purge(&self) -> usize {
        let grace = self.inner.config.gc_grace;
        let mut sessions = self.inner.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_collectable(grace));
        before - sessions.len()
    }

    async fn terminate(&self, token: &str, target: SessionStatus) -> IssuerResult<Transition> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions.get_mut(token).ok_or(IssuerError::NotFound)?;
        Ok(self.terminate_session(session, target))
    }

    fn terminate_session(&self, session: &mut QrSession, target: SessionStatus) -> Transition {
        if !session.advance(target) {
            return Transition::Unchanged;
        }

        let update = match target {
            SessionStatus::Cancelled => StatusUpdate::Cancelled,
            _ => StatusUpdate::Expired,
        };
        self.inner
            .sink
            .publish(&session.token, ChannelEvent::status(update));
        info!(
            "QR session {} is now {}",
            token_fingerprint(&session.token),
            target
        );
        Transition::Applied
    }

    /// Deadlines are enforced by timers; this covers calls that race them
    fn expire_if_overdue(&self, session: &mut QrSession) {
        if session.is_overdue() {
            self.terminate_session(session, SessionStatus::Expired);
        }
    }

    fn refresh_locked(
        &self,
        sessions: &mut HashMap<String, QrSession>,
        token: &str,
    ) -> IssuerResult<SessionGrant> {
        let old = sessions.get(token).ok_or(IssuerError::NotFound)?;
        if old.status.is_terminal() {
            return Err(IssuerError::TerminalState(old.status));
        }
        let subscriber = old.subscriber.clone();
        let device_metadata = old.device_metadata.clone();
        let rotations = old.rotations + 1;

        let grant = self.insert_session(sessions, subscriber, device_metadata, rotations)?;

        if let Some(old) = sessions.get_mut(token) {
            old.advance(SessionStatus::Expired);
            old.replaced_by = Some(grant.token.clone());
        }
        self.inner.sink.publish(
            token,
            ChannelEvent::QrCodeRefreshed {
                renderable_code: grant.renderable_code.clone(),
                token: grant.token.clone(),
            },
        );
        // Subscribers that did not follow the refresh still see the old
        // token close
        self.inner
            .sink
            .publish(token, ChannelEvent::status(StatusUpdate::Expired));

        info!(
            "QR session {} replaced by {}",
            token_fingerprint(token),
            token_fingerprint(&grant.token)
        );
        Ok(grant)
    }

    fn insert_session(
        &self,
        sessions: &mut HashMap<String, QrSession>,
        subscriber: String,
        device_metadata: String,
        rotations: u32,
    ) -> IssuerResult<SessionGrant> {
        let mut token = generate_token();
        while sessions.contains_key(&token) {
            token = generate_token();
        }

        let login_uri = self.uri_for(&token);
        let renderable_code = code::render_data_url(&login_uri, self.inner.config.code_size)
            .map_err(IssuerError::Resource)?;

        let ttl = self.inner.config.ttl;
        let mut session = QrSession::new(token.clone(), subscriber, device_metadata, ttl, rotations);
        session.set_timer(self.spawn_deadline(token.clone()));

        let grant = SessionGrant {
            token: token.clone(),
            login_uri,
            renderable_code,
            expires_at: session.expires_at,
            expires_in: ttl.as_secs(),
        };
        sessions.insert(token, session);
        Ok(grant)
    }

    fn uri_for(&self, token: &str) -> String {
        code::login_uri(
            &self.inner.config.uri_scheme,
            token,
            &self.inner.config.public_url,
        )
    }

    /// Expire (or rotate) the session at its deadline, then collect it
    fn spawn_deadline(&self, token: String) -> tokio::task::AbortHandle {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let ttl = self.inner.config.ttl;
        let grace = self.inner.config.gc_grace;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            match weak.upgrade() {
                Some(inner) => SessionIssuer { inner }.on_deadline(&token).await,
                None => return,
            }

            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                let mut sessions = inner.sessions.write().await;
                if sessions
                    .get(&token)
                    .map(|s| s.is_collectable(grace))
                    .unwrap_or(false)
                {
                    sessions.remove(&token);
                    debug!("Collected QR session {}", token_fingerprint(&token));
                }
            }
        });
        handle.abort_handle()
    }

    async fn on_deadline(&self, token: &str) {
        let mut sessions = self.inner.sessions.write().await;
        let Some(session) = sessions.get_mut(token) else {
            return;
        };
        if session.status.is_terminal() {
            return;
        }

        if session.status == SessionStatus::Pending
            && session.rotations < self.inner.config.max_rotations
        {
            if let Err(e) = self.refresh_locked(&mut sessions, token) {
                warn!("Rotation of {} failed: {}", token_fingerprint(token), e);
                if let Some(session) = sessions.get_mut(token) {
                    self.terminate_session(session, SessionStatus::Expired);
                }
            }
            return;
        }

        self.terminate_session(session, SessionStatus::Expired);
    }
}
