//! QR session record
//!
//! A session only ever moves forward along the status lattice; every mutation
//! goes through [`QrSession::advance`], which acts as the compare-and-set.
//! The credential is never stored: it is handed to the channel on completion
//! and dropped.

use chrono::{DateTime, Utc};
use qrgate_core::SessionStatus;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// A QR login session held by the issuer
#[derive(Debug)]
pub struct QrSession {
    /// Opaque token encoded in the QR code
    pub token: String,
    /// Current status
    pub status: SessionStatus,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the session stops accepting completions
    pub expires_at: DateTime<Utc>,
    /// Client session id the waiting client subscribed with
    pub subscriber: String,
    /// Description of the requesting client
    pub device_metadata: String,
    /// Number of server-side rotations preceding this session
    pub rotations: u32,
    /// Token of the session that replaced this one on refresh
    pub replaced_by: Option<String>,
    deadline: Instant,
    terminal_at: Option<Instant>,
    timer: Option<AbortHandle>,
}

impl QrSession {
    pub fn new(
        token: String,
        subscriber: String,
        device_metadata: String,
        ttl: Duration,
        rotations: u32,
    ) -> Self {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .map(|ttl| now + ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            token,
            status: SessionStatus::Pending,
            created_at: now,
            expires_at,
            subscriber,
            device_metadata,
            rotations,
            replaced_by: None,
            deadline: Instant::now() + ttl,
            terminal_at: None,
            timer: None,
        }
    }

    /// Move to `next` if the lattice allows it; returns whether it moved
    pub fn advance(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.terminal_at = Some(Instant::now());
        }
        true
    }

    /// Past its deadline but not yet marked terminal
    pub fn is_overdue(&self) -> bool {
        !self.status.is_terminal() && Instant::now() >= self.deadline
    }

    /// Terminal for at least `grace`
    pub fn is_collectable(&self, grace: Duration) -> bool {
        self.terminal_at
            .map(|at| Instant::now() >= at + grace)
            .unwrap_or(false)
    }

    /// Seconds until expiry, zero once the deadline has passed
    pub fn expires_in(&self) -> u64 {
        self.deadline
            .saturating_duration_since(Instant::now())
            .as_secs()
    }

    pub(crate) fn set_timer(&mut self, handle: AbortHandle) {
        self.timer = Some(handle);
    }
}

impl Drop for QrSession {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> QrSession {
        QrSession::new(
            "abc123".to_string(),
            "web-session-1".to_string(),
            "test".to_string(),
            Duration::from_secs(60),
            0,
        )
    }

    #[test]
    fn test_forward_only() {
        let mut s = session();
        assert!(s.advance(SessionStatus::Scanned));
        assert!(!s.advance(SessionStatus::Pending));
        assert!(s.advance(SessionStatus::Authenticated));
        assert!(!s.advance(SessionStatus::Scanned));
        assert!(!s.advance(SessionStatus::Expired));
        assert_eq!(s.status, SessionStatus::Authenticated);
    }

    #[test]
    fn test_not_collectable_until_terminal() {
        let mut s = session();
        assert!(!s.is_collectable(Duration::ZERO));
        s.advance(SessionStatus::Cancelled);
        assert!(s.is_collectable(Duration::ZERO));
        assert!(!s.is_collectable(Duration::from_secs(30)));
    }

    #[test]
    fn test_expires_in() {
        let s = session();
        assert!(s.expires_in() <= 60);
        assert!(s.expires_at > s.created_at);
        assert!(!s.is_overdue());
    }
}
