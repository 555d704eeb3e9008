//! Transport seams used by the handshake driver
//!
//! The driver only needs two things from the outside world: a way to create
//! a session and a channel connection that can join tokens and yield frames.

use async_trait::async_trait;
use qrgate_core::protocol::{CreateSessionRequest, CreateSessionResponse};
use qrgate_core::{ChannelFrame, Result};

/// Session creation against the issuer
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, request: CreateSessionRequest)
        -> Result<CreateSessionResponse>;
}

/// Opens channel connections
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChannelConnection>>;
}

/// One live channel connection
#[async_trait]
pub trait ChannelConnection: Send {
    /// Start receiving events for `token`
    ///
    /// `client_session_id` must be the id the session was created with; the
    /// server refuses anyone else.
    async fn join(&mut self, token: &str, client_session_id: &str) -> Result<()>;

    /// Stop receiving events for `token`
    async fn leave(&mut self, token: &str) -> Result<()>;

    /// Next frame from the server, `None` once the connection is gone
    async fn next_frame(&mut self) -> Option<ChannelFrame>;
}
