//! Credential handoff to the host application
//!
//! Establishes the host session from a delivered credential exactly once per
//! attempt and schedules the single post-login navigation.

use qrgate_core::{Credential, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Display severity for host notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Danger,
}

/// Navigation performed after a successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostAuthAction {
    /// Leave the login page for the given path
    Redirect(String),
    /// Reload the current page with the new session
    Reload,
}

impl PostAuthAction {
    /// Redirect home from a login page, otherwise reload in place
    pub fn for_path(path: &str) -> Self {
        if path.contains("/login") {
            PostAuthAction::Redirect("/".to_string())
        } else {
            PostAuthAction::Reload
        }
    }
}

/// The host application around the handshake
pub trait HostSession: Send + Sync + 'static {
    /// Install the credential as the host's authenticated session
    fn establish_session(&self, credential: &Credential);

    /// Show a localized message
    fn notify_user(&self, message_key: &str, severity: Severity);

    /// Path of the page currently showing the handshake
    fn current_path(&self) -> String;

    /// Perform the post-login navigation
    fn navigate(&self, action: PostAuthAction);
}

/// Result of a completed handoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Established {
    /// Handshake attempt that produced the session
    pub attempt: u64,
    /// Navigation scheduled after the success indicator
    pub action: PostAuthAction,
}

/// Hands a credential to the host, once
pub struct CredentialHandoff<H: HostSession> {
    host: Arc<H>,
    attempt: u64,
    redirect_delay: Duration,
    established: Option<Established>,
}

impl<H: HostSession> CredentialHandoff<H> {
    pub fn new(host: Arc<H>, attempt: u64, redirect_delay: Duration) -> Self {
        Self {
            host,
            attempt,
            redirect_delay,
            established: None,
        }
    }

    /// Validate the credential, establish the host session and schedule the
    /// post-login navigation
    ///
    /// Later calls return the first result without touching the host.
    pub fn finalize(&mut self, credential: &Credential) -> Result<Established> {
        if let Some(established) = &self.established {
            debug!(
                "Ignoring duplicate credential for attempt {}",
                self.attempt
            );
            return Ok(established.clone());
        }

        if !credential.is_well_formed() {
            return Err(Error::Auth("credential is malformed".to_string()));
        }

        self.host.establish_session(credential);
        self.host.notify_user("login_successful", Severity::Success);

        let action = PostAuthAction::for_path(&self.host.current_path());
        let host = Arc::clone(&self.host);
        let delay = self.redirect_delay;
        let scheduled = action.clone();
        // The navigation outlives the handshake that triggered it
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            host.navigate(scheduled);
        });

        info!("Host session established for attempt {}", self.attempt);
        let established = Established {
            attempt: self.attempt,
            action,
        };
        self.established = Some(established.clone());
        Ok(established)
    }

    pub fn established(&self) -> Option<&Established> {
        self.established.as_ref()
    }
}
