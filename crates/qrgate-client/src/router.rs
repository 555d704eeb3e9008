//! Login flow selection
//!
//! The host tells us at startup whether it runs in a regular browser or
//! inside the companion app's web view. Browsers get the QR handshake; the
//! embedded web view asks the surrounding app for single sign-on instead.

use qrgate_core::LoginVariant;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::handoff::{HostSession, Severity};

/// Flow presented on the login page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFlow {
    QrHandshake,
    EmbeddedSso,
}

impl LoginFlow {
    pub fn select(variant: LoginVariant) -> Self {
        match variant {
            LoginVariant::QrCode => LoginFlow::QrHandshake,
            LoginVariant::EmbeddedApp => LoginFlow::EmbeddedSso,
        }
    }
}

/// Message channel into the companion app hosting the web view
pub trait SsoBridge: Send + Sync {
    fn is_available(&self) -> bool;

    fn post_message(&self, message: &str) -> Result<(), String>;
}

/// Action the companion app listens for on its bridge
const SSO_ACTION: &str = "requestForumSSO";

#[derive(Serialize)]
struct SsoRequest {
    action: &'static str,
}

/// Result of pressing the sign-in button
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsoOutcome {
    /// Request handed to the app; it finishes sign-in on its own
    Requested,
    /// A request is already in flight
    InFlight,
    /// No usable bridge; the user may try again
    BridgeUnavailable,
}

/// Single-flight SSO request through the app bridge
pub struct EmbeddedSso<B, H> {
    bridge: Arc<B>,
    host: Arc<H>,
    signing_in: AtomicBool,
}

impl<B: SsoBridge, H: HostSession> EmbeddedSso<B, H> {
    pub fn new(bridge: Arc<B>, host: Arc<H>) -> Self {
        Self {
            bridge,
            host,
            signing_in: AtomicBool::new(false),
        }
    }

    pub fn is_signing_in(&self) -> bool {
        self.signing_in.load(Ordering::SeqCst)
    }

    pub fn request_sign_in(&self) -> SsoOutcome {
        if self.signing_in.swap(true, Ordering::SeqCst) {
            return SsoOutcome::InFlight;
        }

        if self.bridge.is_available() {
            let message = serde_json::to_string(&SsoRequest {
                action: SSO_ACTION,
            })
            .unwrap_or_default();
            match self.bridge.post_message(&message) {
                Ok(()) => {
                    info!("SSO request posted to app bridge");
                    return SsoOutcome::Requested;
                }
                Err(e) => error!("Failed to post SSO request: {}", e),
            }
        } else {
            error!("SSO bridge not detected");
        }

        self.host
            .notify_user("sso_error_bridge_not_found", Severity::Danger);
        self.signing_in.store(false, Ordering::SeqCst);
        SsoOutcome::BridgeUnavailable
    }
}
