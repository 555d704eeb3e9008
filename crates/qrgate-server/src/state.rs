//! Shared application state

use crate::channel::RealtimeChannel;
use qrgate_auth::{IssuerConfig, SessionIssuer};
use qrgate_core::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Authoritative session store
    pub issuer: SessionIssuer,
    /// Realtime delivery of session events
    pub channel: RealtimeChannel,
}

impl AppState {
    /// Create the issuer and wire it to a fresh channel
    pub fn new(config: Config) -> Self {
        let channel = RealtimeChannel::new(config.channel_grace());
        let issuer = SessionIssuer::new(IssuerConfig::from(&config), Arc::new(channel.clone()));
        Self {
            config,
            issuer,
            channel,
        }
    }

    /// Periodically collect terminal sessions and idle channel topics
    pub fn spawn_maintenance(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let sessions = state.issuer.purge().await;
                let topics = state.channel.prune();
                if sessions > 0 || topics > 0 {
                    debug!(
                        "Maintenance dropped {} sessions and {} topics",
                        sessions, topics
                    );
                }
            }
        })
    }
}
