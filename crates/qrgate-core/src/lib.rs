//! QRGate Core - Shared types and protocol definitions
//!
//! This crate provides the foundational types used by the session issuer,
//! the realtime channel and the client handshake.

pub mod config;
pub mod error;
pub mod protocol;

pub use config::{Config, LoginVariant};
pub use error::{Error, Result};
pub use protocol::{
    ChannelEvent, ChannelFrame, ClientMessage, Credential, EventSink, SessionStatus, StatusUpdate,
};
