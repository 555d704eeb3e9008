//! QRGate - cross-device QR code login
//!
//! Serves the session issuer, the mobile completion endpoints and the
//! realtime channel. Can also log in against a running server, or run the
//! whole handshake in-process as a demo.

mod loopback;

use anyhow::Result;
use clap::Parser;
use qrgate_client::{
    EmbeddedSso, Handshake, HandshakeOptions, HandshakeOutcome, HandshakeState, HttpSessionApi,
    LoginFlow, SsoOutcome, WsChannelConnector,
};
use qrgate_core::{Config, Credential, LoginVariant};
use qrgate_server::{create_router, AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use loopback::{
    DetachedBridge, LocalConnector, LocalSessionApi, SimulatedDevice, TerminalHost,
};

/// How often terminal sessions and idle channel topics are swept
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15);

/// QRGate - log in on one device by scanning a code with another
#[derive(Parser, Debug)]
#[command(name = "qrgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Server port
    #[arg(short, long, default_value = "3001", env = "QRGATE_PORT")]
    port: u16,

    /// Public base URL embedded in QR codes (default: http://<local-ip>:<port>)
    #[arg(long, env = "QRGATE_PUBLIC_URL")]
    public_url: Option<String>,

    /// URI scheme registered by the companion app
    #[arg(long, default_value = "qrgate", env = "QRGATE_URI_SCHEME")]
    uri_scheme: String,

    /// QR session lifetime in seconds
    #[arg(long, default_value = "120", env = "QRGATE_SESSION_TTL")]
    session_ttl: u64,

    /// Maximum number of live sessions
    #[arg(long, default_value = "10000", env = "QRGATE_MAX_SESSIONS")]
    max_sessions: usize,

    /// Rotate unscanned codes this many times before expiring them
    #[arg(long, default_value = "0", env = "QRGATE_MAX_ROTATIONS")]
    max_rotations: u32,

    /// Login flow: qr-code or embedded-app
    #[arg(short = 'l', long, default_value = "qr-code", env = "QRGATE_LOGIN_VARIANT")]
    login_variant: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run the handshake in-process with a simulated phone instead of serving
    #[arg(long)]
    demo: bool,

    /// Log in against the server at this URL instead of serving
    #[arg(long, value_name = "URL", env = "QRGATE_CONNECT", conflicts_with = "demo")]
    connect: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("QRGate v{}", env!("CARGO_PKG_VERSION"));

    let login_variant: LoginVariant = args
        .login_variant
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let public_url = args.public_url.clone().unwrap_or_else(|| {
        let host = get_local_ip().unwrap_or_else(|| "127.0.0.1".to_string());
        format!("http://{}:{}", host, args.port)
    });

    let config = Config::new()
        .with_port(args.port)
        .with_public_url(public_url)
        .with_uri_scheme(args.uri_scheme.clone())
        .with_session_ttl(args.session_ttl)
        .with_max_sessions(args.max_sessions)
        .with_max_rotations(args.max_rotations)
        .with_login_variant(login_variant);

    if let Some(server_url) = &args.connect {
        return run_client(server_url, &config).await;
    }

    let state = Arc::new(AppState::new(config.clone()));
    let maintenance = state.spawn_maintenance(MAINTENANCE_INTERVAL);

    if args.demo {
        run_demo(&state).await?;
        maintenance.abort();
        return Ok(());
    }

    let router = create_router(state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));

    println!();
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║                     QRGate Server                         ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("  Issuer:      {}/auth/qr/generate", config.public_url);
    println!("  Channel:     {}/ws/qr-auth", config.public_url);
    println!("  Session TTL: {}s", config.session_ttl_secs);
    println!("  Login flow:  {}", config.login_variant.as_str());
    if config.max_rotations > 0 {
        println!("  Rotations:   {}", config.max_rotations);
    }
    println!();

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    maintenance.abort();
    info!("Goodbye!");
    Ok(())
}

/// Drive a complete login against the in-process issuer
async fn run_demo(state: &Arc<AppState>) -> Result<()> {
    let config = &state.config;
    let host = Arc::new(TerminalHost::new("/login"));

    if LoginFlow::select(config.login_variant) == LoginFlow::EmbeddedSso {
        let sso = EmbeddedSso::new(Arc::new(DetachedBridge), host);
        if sso.request_sign_in() != SsoOutcome::Requested {
            warn!("Embedded sign-in needs the companion app; try --login-variant qr-code");
        }
        return Ok(());
    }

    let options = HandshakeOptions {
        device_metadata: format!("qrgate-demo/{}", env!("CARGO_PKG_VERSION")),
        ..HandshakeOptions::from(config)
    };
    let (handshake, mut handle) = Handshake::new(
        Arc::new(LocalSessionApi::new(state.issuer.clone())),
        Arc::new(LocalConnector::new(
            state.issuer.clone(),
            state.channel.clone(),
        )),
        host.clone(),
        options,
    );
    let driver = tokio::spawn(handshake.run());

    let view = handle
        .wait_for(|v| v.state != HandshakeState::Generating)
        .await
        .ok_or_else(|| anyhow::anyhow!("handshake stopped before creating a session"))?;
    let token = match (view.state, view.token) {
        (HandshakeState::Waiting, Some(token)) => token,
        _ => anyhow::bail!("could not create a QR session: {}", view.message_key),
    };

    let uri = state.issuer.login_uri(&token).await?;
    println!();
    println!("  Scan with the companion app:");
    println!();
    display_qr_code(&uri);
    println!();
    println!("  {}", uri);
    println!();

    let device = SimulatedDevice::new(state.issuer.clone(), Duration::from_secs(1));
    device
        .approve(&token, Credential::new(Uuid::new_v4().simple().to_string()))
        .await?;

    match driver.await? {
        HandshakeOutcome::Authenticated(established) => {
            info!("Logged in on attempt {}", established.attempt);
            // Let the scheduled navigation run before exiting
            tokio::time::sleep(config.redirect_delay() + Duration::from_millis(100)).await;
        }
        HandshakeOutcome::Unmounted => warn!("Handshake ended without a login"),
    }

    if host.session().is_none() {
        anyhow::bail!("no session was established");
    }
    Ok(())
}

/// Wait for a login on a remote server, as a browser would
async fn run_client(server_url: &str, config: &Config) -> Result<()> {
    let server_url = server_url.trim_end_matches('/');
    let host = Arc::new(TerminalHost::new("/login"));
    let options = HandshakeOptions {
        device_metadata: format!("qrgate-cli/{}", env!("CARGO_PKG_VERSION")),
        ..HandshakeOptions::from(config)
    };
    let (handshake, handle) = Handshake::new(
        Arc::new(HttpSessionApi::new(server_url)),
        Arc::new(WsChannelConnector::new(server_url)),
        host.clone(),
        options,
    );
    let driver = tokio::spawn(handshake.run());

    let mut views = handle.subscribe();
    let mut shown: Option<String> = None;
    loop {
        let view = views.borrow_and_update().clone();
        match view.state {
            HandshakeState::Waiting if view.token != shown => {
                if let Some(token) = &view.token {
                    println!();
                    println!("  Scan the code at:");
                    println!("  {}/auth/qr/image?token={}", server_url, token);
                    println!();
                }
                shown = view.token;
            }
            HandshakeState::Scanned => info!("Code scanned, confirm on the device"),
            HandshakeState::Expired => {
                info!("Code expired, requesting a new one");
                handle.retry();
            }
            HandshakeState::Error => {
                handle.unmount();
                anyhow::bail!("login failed: {}", view.message_key);
            }
            _ => {}
        }

        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.unmount();
                break;
            }
        }
    }

    match driver.await? {
        HandshakeOutcome::Authenticated(established) => {
            info!("Logged in on attempt {}", established.attempt);
            tokio::time::sleep(config.redirect_delay() + Duration::from_millis(100)).await;
        }
        HandshakeOutcome::Unmounted => warn!("Handshake ended without a login"),
    }
    Ok(())
}

/// Get the local IP address
fn get_local_ip() -> Option<String> {
    use std::net::UdpSocket;

    // Connecting a UDP socket sends nothing but selects the outbound interface
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    Some(addr.ip().to_string())
}

/// Display QR code in terminal
fn display_qr_code(data: &str) {
    use qrcode::QrCode;

    let code = match QrCode::new(data.as_bytes()) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to generate QR code: {}", e);
            return;
        }
    };

    // Render as Unicode block characters for terminal display
    let string = code
        .render::<char>()
        .quiet_zone(true)
        .module_dimensions(2, 1)
        .build();

    for line in string.lines() {
        println!("  {}", line);
    }
}
