//! QRGate Server - Axum-based HTTP and WebSocket server
//!
//! Hosts the session issuer API, the mobile completion contract and the
//! realtime channel that pushes session events to waiting clients.

pub mod channel;
pub mod http;
pub mod state;
pub mod websocket;

pub use channel::{Outbound, RealtimeChannel, Subscription};
pub use http::create_router;
pub use state::AppState;
pub use websocket::handle_qr_auth_socket;
