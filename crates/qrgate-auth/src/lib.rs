//! QRGate Auth - QR session issuing and lifecycle
//!
//! Owns the authoritative state of every QR login session and publishes each
//! committed transition to an [`EventSink`](qrgate_core::EventSink).
//!
//! # Session Flow
//!
//! 1. A waiting client calls `SessionIssuer::create_session()` and renders the
//!    returned code
//! 2. The companion app scans the code and calls `mark_scanned()`
//! 3. The companion app submits the user's credential via
//!    `complete_authentication()`
//! 4. The credential is pushed once to the waiting client through the sink
//!
//! Sessions that are not completed in time are expired by a per-session timer
//! (or rotated, when rotation is enabled) and dropped after a grace period.
//!
//! # Example
//!
//! ```no_run
//! use qrgate_auth::{IssuerConfig, SessionIssuer};
//! use qrgate_core::protocol::NullSink;
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let issuer = SessionIssuer::new(IssuerConfig::default(), Arc::new(NullSink));
//!     let grant = issuer.create_session("web-session-1", "Firefox").await.unwrap();
//!     println!("Scan me: {}", grant.login_uri);
//! }
//! ```

pub mod code;
pub mod issuer;
pub mod session;
pub mod token;

pub use code::{login_uri, render_data_url, render_png};
pub use issuer::{
    IssuerConfig, IssuerError, IssuerResult, SessionGrant, SessionIssuer, SessionSnapshot,
    Transition,
};
pub use session::QrSession;
pub use token::{generate_token, token_fingerprint};
