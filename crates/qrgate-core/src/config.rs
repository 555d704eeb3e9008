//! Configuration types for QRGate

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard limit for the session creation request, in milliseconds
pub const CREATE_TIMEOUT_MS: u64 = 5_000;

/// Which login flow the host application presents
///
/// Injected at startup by the host instead of being detected from the
/// environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoginVariant {
    /// Regular browser: show a QR code and wait for the paired app
    #[default]
    QrCode,
    /// Running inside the companion app's web view: ask the app for SSO
    EmbeddedApp,
}

impl LoginVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginVariant::QrCode => "qr-code",
            LoginVariant::EmbeddedApp => "embedded-app",
        }
    }
}

impl std::str::FromStr for LoginVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qr-code" | "qr" | "browser" => Ok(LoginVariant::QrCode),
            "embedded-app" | "embedded" | "app" => Ok(LoginVariant::EmbeddedApp),
            _ => Err(format!(
                "Invalid login variant: {}. Use: qr-code, embedded-app",
                s
            )),
        }
    }
}

/// Main configuration for QRGate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server port
    pub port: u16,
    /// Public base URL embedded in the scannable code
    pub public_url: String,
    /// URI scheme the companion app registers for (e.g. `qrgate://`)
    pub uri_scheme: String,
    /// Lifetime of a QR session in seconds
    pub session_ttl_secs: u64,
    /// How long terminal sessions are kept before being dropped
    pub gc_grace_secs: u64,
    /// How long the channel buffers events for a token nobody has joined yet
    pub channel_grace_ms: u64,
    /// Upper bound on live sessions held by the issuer
    pub max_sessions: usize,
    /// How many times an unscanned session is rotated before it expires
    pub max_rotations: u32,
    /// Client-side limit for the creation request
    pub create_timeout_ms: u64,
    /// Delay between a successful login and the post-login navigation
    pub redirect_delay_ms: u64,
    /// Default size of rendered QR images in pixels
    pub qr_size: u32,
    /// Login flow presented by the host
    pub login_variant: LoginVariant,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            public_url: "http://127.0.0.1:3001".to_string(),
            uri_scheme: "qrgate".to_string(),
            session_ttl_secs: 120,
            gc_grace_secs: 30,
            channel_grace_ms: 10_000,
            max_sessions: 10_000,
            max_rotations: 0,
            create_timeout_ms: CREATE_TIMEOUT_MS,
            redirect_delay_ms: 1_500,
            qr_size: 256,
            login_variant: LoginVariant::QrCode,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set public URL
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into();
        self
    }

    /// Builder pattern: set URI scheme
    pub fn with_uri_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.uri_scheme = scheme.into();
        self
    }

    /// Builder pattern: set session TTL
    pub fn with_session_ttl(mut self, secs: u64) -> Self {
        self.session_ttl_secs = secs;
        self
    }

    /// Builder pattern: set terminal session grace period
    pub fn with_gc_grace(mut self, secs: u64) -> Self {
        self.gc_grace_secs = secs;
        self
    }

    /// Builder pattern: set channel buffering grace period
    pub fn with_channel_grace_ms(mut self, ms: u64) -> Self {
        self.channel_grace_ms = ms;
        self
    }

    /// Builder pattern: set session capacity
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Builder pattern: set server-side rotation limit
    pub fn with_max_rotations(mut self, rotations: u32) -> Self {
        self.max_rotations = rotations;
        self
    }

    /// Builder pattern: set post-login navigation delay
    pub fn with_redirect_delay_ms(mut self, ms: u64) -> Self {
        self.redirect_delay_ms = ms;
        self
    }

    /// Builder pattern: set login variant
    pub fn with_login_variant(mut self, variant: LoginVariant) -> Self {
        self.login_variant = variant;
        self
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn gc_grace(&self) -> Duration {
        Duration::from_secs(self.gc_grace_secs)
    }

    pub fn channel_grace(&self) -> Duration {
        Duration::from_millis(self.channel_grace_ms)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    pub fn redirect_delay(&self) -> Duration {
        Duration::from_millis(self.redirect_delay_ms)
    }
}
