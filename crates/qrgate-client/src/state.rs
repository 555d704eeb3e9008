//! Client handshake state machine
//!
//! The machine has a closed set of states and a fixed transition table.
//! Inputs not in the table are rejected without changing anything; the
//! driver treats a rejection as an absorbed duplicate or out-of-order event.

use qrgate_core::{Credential, Error};
use serde::Serialize;

/// Visible state of one handshake attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeState {
    Generating,
    Waiting,
    Scanned,
    Authenticated,
    Expired,
    Error,
}

impl HandshakeState {
    /// Only reached once per attempt and never left
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Authenticated)
    }

    /// States left only through an explicit retry
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HandshakeState::Expired | HandshakeState::Error)
    }

    /// States in which the channel subscription is live
    pub fn is_listening(&self) -> bool {
        matches!(self, HandshakeState::Waiting | HandshakeState::Scanned)
    }

    pub fn message_key(&self) -> &'static str {
        match self {
            HandshakeState::Generating => "generating_qr_code",
            HandshakeState::Waiting => "scan_qr_with_app",
            HandshakeState::Scanned => "qr_scanned_confirm_on_device",
            HandshakeState::Authenticated => "login_successful_redirecting",
            HandshakeState::Expired => "qr_code_expired",
            HandshakeState::Error => "qr_generation_failed",
        }
    }
}

/// Everything that can move the machine
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeInput {
    SessionCreated {
        token: String,
        renderable_code: String,
    },
    CreationFailed(Error),
    Scanned,
    /// `qr-auth-success`; the credential may be missing
    AuthSucceeded(Option<Credential>),
    Expired,
    /// Shown as expired, the cancel reason is not surfaced
    Cancelled,
    /// The local mirror of the server TTL ran out
    LocalExpiry,
    CodeRefreshed {
        token: String,
        renderable_code: String,
    },
    ChannelFailed(Error),
    Retry,
}

impl HandshakeInput {
    fn name(&self) -> &'static str {
        match self {
            HandshakeInput::SessionCreated { .. } => "session-created",
            HandshakeInput::CreationFailed(_) => "creation-failed",
            HandshakeInput::Scanned => "scanned",
            HandshakeInput::AuthSucceeded(_) => "auth-succeeded",
            HandshakeInput::Expired => "expired",
            HandshakeInput::Cancelled => "cancelled",
            HandshakeInput::LocalExpiry => "local-expiry",
            HandshakeInput::CodeRefreshed { .. } => "code-refreshed",
            HandshakeInput::ChannelFailed(_) => "channel-failed",
            HandshakeInput::Retry => "retry",
        }
    }
}

/// An input that has no entry in the transition table for the current state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("input {input} is not accepted in state {from:?}")]
pub struct Rejected {
    pub from: HandshakeState,
    pub input: &'static str,
}

/// The handshake state machine and the data attached to the current attempt
#[derive(Debug, Clone)]
pub struct ClientStateMachine {
    state: HandshakeState,
    attempt: u64,
    token: Option<String>,
    renderable_code: Option<String>,
    credential: Option<Credential>,
    error: Option<Error>,
}

impl Default for ClientStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStateMachine {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Generating,
            attempt: 1,
            token: None,
            renderable_code: None,
            credential: None,
            error: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn renderable_code(&self) -> Option<&str> {
        self.renderable_code.as_deref()
    }

    /// Credential accepted on entering `authenticated`
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Message key for the current state, preferring the error's own key
    pub fn message_key(&self) -> &'static str {
        match (&self.state, &self.error) {
            (HandshakeState::Error, Some(err)) => err.message_key(),
            (state, _) => state.message_key(),
        }
    }

    /// Apply one input; returns the new state or the rejection
    pub fn apply(&mut self, input: HandshakeInput) -> Result<HandshakeState, Rejected> {
        use HandshakeInput as I;
        use HandshakeState as S;

        let next = match (self.state, input) {
            (
                S::Generating,
                I::SessionCreated {
                    token,
                    renderable_code,
                },
            ) => {
                self.token = Some(token);
                self.renderable_code = Some(renderable_code);
                S::Waiting
            }
            (S::Generating, I::CreationFailed(err)) => {
                self.error = Some(err);
                S::Error
            }
            (S::Waiting, I::Scanned) => S::Scanned,
            (S::Waiting | S::Scanned, I::AuthSucceeded(credential)) => match credential {
                Some(credential) if credential.is_well_formed() => {
                    self.credential = Some(credential);
                    S::Authenticated
                }
                _ => {
                    self.error = Some(Error::Auth(
                        "authentication did not return a usable session".to_string(),
                    ));
                    S::Error
                }
            },
            (S::Waiting | S::Scanned, I::Expired | I::Cancelled | I::LocalExpiry) => S::Expired,
            (
                S::Waiting,
                I::CodeRefreshed {
                    token,
                    renderable_code,
                },
            ) => {
                self.token = Some(token);
                self.renderable_code = Some(renderable_code);
                S::Waiting
            }
            (S::Waiting | S::Scanned, I::ChannelFailed(err)) => {
                self.error = Some(err);
                S::Error
            }
            (S::Expired | S::Error, I::Retry) => {
                self.attempt += 1;
                self.token = None;
                self.renderable_code = None;
                self.credential = None;
                self.error = None;
                S::Generating
            }
            (from, input) => {
                return Err(Rejected {
                    from,
                    input: input.name(),
                })
            }
        };

        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(token: &str) -> HandshakeInput {
        HandshakeInput::SessionCreated {
            token: token.to_string(),
            renderable_code: format!("data:{}", token),
        }
    }

    fn waiting(token: &str) -> ClientStateMachine {
        let mut machine = ClientStateMachine::new();
        machine.apply(created(token)).unwrap();
        machine
    }

    #[test]
    fn test_happy_path() {
        let mut machine = waiting("abc123");
        assert_eq!(machine.state(), HandshakeState::Waiting);
        assert_eq!(machine.token(), Some("abc123"));

        assert_eq!(
            machine.apply(HandshakeInput::Scanned),
            Ok(HandshakeState::Scanned)
        );
        assert_eq!(
            machine.apply(HandshakeInput::AuthSucceeded(Some(Credential::new("xyz")))),
            Ok(HandshakeState::Authenticated)
        );
        assert_eq!(machine.credential(), Some(&Credential::new("xyz")));
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn test_authenticated_absorbs_everything() {
        let mut machine = waiting("abc123");
        machine
            .apply(HandshakeInput::AuthSucceeded(Some(Credential::new("xyz"))))
            .unwrap();

        for input in [
            HandshakeInput::Scanned,
            HandshakeInput::AuthSucceeded(Some(Credential::new("xyz"))),
            HandshakeInput::Expired,
            HandshakeInput::LocalExpiry,
            HandshakeInput::Retry,
        ] {
            assert!(machine.apply(input).is_err());
            assert_eq!(machine.state(), HandshakeState::Authenticated);
        }
    }

    #[test]
    fn test_missing_credential_is_auth_error() {
        let mut machine = waiting("abc123");
        assert_eq!(
            machine.apply(HandshakeInput::AuthSucceeded(None)),
            Ok(HandshakeState::Error)
        );
        assert!(matches!(machine.error(), Some(Error::Auth(_))));
        assert_eq!(machine.message_key(), "qr_auth_missing_session");

        let mut machine = waiting("abc123");
        machine
            .apply(HandshakeInput::AuthSucceeded(Some(Credential::new(""))))
            .unwrap();
        assert_eq!(machine.state(), HandshakeState::Error);
    }

    #[test]
    fn test_cancel_collapses_to_expired() {
        let mut machine = waiting("abc123");
        machine.apply(HandshakeInput::Scanned).unwrap();
        assert_eq!(
            machine.apply(HandshakeInput::Cancelled),
            Ok(HandshakeState::Expired)
        );
    }

    #[test]
    fn test_refresh_only_while_waiting() {
        let mut machine = waiting("abc123");
        let refreshed = HandshakeInput::CodeRefreshed {
            token: "def456".to_string(),
            renderable_code: "data:def456".to_string(),
        };
        assert_eq!(
            machine.apply(refreshed.clone()),
            Ok(HandshakeState::Waiting)
        );
        assert_eq!(machine.token(), Some("def456"));
        assert_eq!(machine.attempt(), 1);

        machine.apply(HandshakeInput::Scanned).unwrap();
        assert!(machine.apply(refreshed).is_err());
        assert_eq!(machine.token(), Some("def456"));
    }

    #[test]
    fn test_duplicate_scan_rejected() {
        let mut machine = waiting("abc123");
        machine.apply(HandshakeInput::Scanned).unwrap();
        assert_eq!(
            machine.apply(HandshakeInput::Scanned),
            Err(Rejected {
                from: HandshakeState::Scanned,
                input: "scanned"
            })
        );
    }

    #[test]
    fn test_retry_only_from_recoverable_states() {
        let mut machine = ClientStateMachine::new();
        assert!(machine.apply(HandshakeInput::Retry).is_err());

        machine
            .apply(HandshakeInput::CreationFailed(Error::CreationTimeout(5000)))
            .unwrap();
        assert_eq!(machine.message_key(), "qr_request_timed_out");

        assert_eq!(
            machine.apply(HandshakeInput::Retry),
            Ok(HandshakeState::Generating)
        );
        assert_eq!(machine.attempt(), 2);
        assert!(machine.error().is_none());

        let mut machine = waiting("abc123");
        assert!(machine.apply(HandshakeInput::Retry).is_err());
        machine.apply(HandshakeInput::Expired).unwrap();
        machine.apply(HandshakeInput::Retry).unwrap();
        assert_eq!(machine.token(), None);
    }

    #[test]
    fn test_events_before_creation_rejected() {
        let mut machine = ClientStateMachine::new();
        assert!(machine.apply(HandshakeInput::Scanned).is_err());
        assert!(machine.apply(HandshakeInput::LocalExpiry).is_err());
        assert_eq!(machine.state(), HandshakeState::Generating);
    }
}
