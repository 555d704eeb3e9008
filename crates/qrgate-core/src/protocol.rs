//! Wire and domain types shared by the issuer, the channel and the client

use serde::{Deserialize, Serialize};

/// Longest credential accepted by structural validation
pub const MAX_CREDENTIAL_LEN: usize = 8 * 1024;

/// Authoritative status of a QR session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Scanned,
    Authenticated,
    Expired,
    Cancelled,
}

impl SessionStatus {
    /// No transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Authenticated | SessionStatus::Expired | SessionStatus::Cancelled
        )
    }

    /// Whether `next` is a legal forward step from this status
    pub fn can_advance_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Scanned)
                | (Pending, Authenticated)
                | (Scanned, Authenticated)
                | (Pending, Expired)
                | (Scanned, Expired)
                | (Pending, Cancelled)
                | (Scanned, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Scanned => "scanned",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Expired => "expired",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final authentication artifact handed to the host application
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Structural check: non-empty, bounded, no whitespace or control bytes
    pub fn is_well_formed(&self) -> bool {
        !self.token.is_empty()
            && self.token.len() <= MAX_CREDENTIAL_LEN
            && !self
                .token
                .chars()
                .any(|c| c.is_whitespace() || c.is_control())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .finish()
    }
}

/// Status values pushed through `qr-status-update`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusUpdate {
    Scanned,
    Expired,
    Cancelled,
}

/// Events pushed from the issuer to subscribers of a token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelEvent {
    /// Session moved to scanned, expired or cancelled
    QrStatusUpdate { status: StatusUpdate },
    /// Session authenticated; the credential travels with the event
    QrAuthSuccess {
        /// Absent when the completion did not produce a usable session
        #[serde(default)]
        credential: Option<Credential>,
    },
    /// Server rotated the code for the same logical attempt
    #[serde(rename_all = "camelCase")]
    QrCodeRefreshed {
        renderable_code: String,
        token: String,
    },
    /// Connection-level failure, never carries internal detail
    Error { message: String },
    /// Keepalive
    Ping { timestamp: u64 },
}

impl ChannelEvent {
    pub fn status(status: StatusUpdate) -> Self {
        ChannelEvent::QrStatusUpdate { status }
    }

    pub fn auth_success(credential: Credential) -> Self {
        ChannelEvent::QrAuthSuccess {
            credential: Some(credential),
        }
    }
}

/// A channel event together with the token it was published for
///
/// Connection-level events (errors, pings) carry no token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    #[serde(rename = "qrToken", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub event: ChannelEvent,
}

impl ChannelFrame {
    pub fn for_token(token: impl Into<String>, event: ChannelEvent) -> Self {
        Self {
            token: Some(token.into()),
            event,
        }
    }

    pub fn connection(event: ChannelEvent) -> Self {
        Self { token: None, event }
    }
}

/// Messages sent by a waiting client over the channel connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Subscribe to a token; only the client that created the session may
    JoinQrSession {
        #[serde(rename = "qrToken")]
        token: String,
        #[serde(rename = "clientSessionId")]
        client_session_id: String,
    },
    LeaveQrSession {
        #[serde(rename = "qrToken")]
        token: String,
    },
}

/// Receiver side of the issuer's transition stream
///
/// Implementations must not block: the issuer calls `publish` while it
/// holds its write lock so that delivery order equals commit order.
pub trait EventSink: Send + Sync {
    fn publish(&self, token: &str, event: ChannelEvent);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _token: &str, _event: ChannelEvent) {}
}

/// Request body for session creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Identifier the waiting client will subscribe with
    pub client_session_id: String,
    /// Free-form description of the requesting client (user agent)
    #[serde(default)]
    pub device_metadata: String,
}

/// Response body for session creation and refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub token: String,
    /// `data:image/png;base64,...` URL of the scannable code
    pub renderable_code: String,
    /// Seconds until the session expires
    pub expires_in: u64,
}

/// Request body carrying only a session token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

/// Request body sent by the mobile app to complete a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub token: String,
    pub credential: Credential,
}

/// Session status snapshot returned by the issuer API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: SessionStatus,
    pub expires_in: u64,
    /// Set once the session was superseded by a refresh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<String>,
}
