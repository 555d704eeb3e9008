//! QRGate Client - the waiting side of the QR login handshake
//!
//! A browser (or any other client) requests a session, shows the returned
//! code, and listens on the realtime channel until the paired mobile app
//! authenticates it. The resulting credential is handed to the host exactly
//! once.

pub mod handoff;
pub mod handshake;
pub mod http;
pub mod router;
pub mod state;
pub mod transport;
pub mod ws;

pub use handoff::{CredentialHandoff, Established, HostSession, PostAuthAction, Severity};
pub use handshake::{
    Backoff, Handshake, HandshakeCommand, HandshakeHandle, HandshakeOptions, HandshakeOutcome,
    HandshakeView,
};
pub use http::HttpSessionApi;
pub use router::{EmbeddedSso, LoginFlow, SsoBridge, SsoOutcome};
pub use state::{ClientStateMachine, HandshakeInput, HandshakeState, Rejected};
pub use transport::{ChannelConnection, ChannelConnector, SessionApi};
pub use ws::WsChannelConnector;
