//! Handshake driver
//!
//! Runs the client state machine against a session API and a channel
//! connector on a single task. The UI observes a [`HandshakeView`] through a
//! watch channel and talks back through [`HandshakeCommand`]s.

use qrgate_core::protocol::CreateSessionRequest;
use qrgate_core::{ChannelEvent, ChannelFrame, Config, Error, Result, StatusUpdate};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handoff::{CredentialHandoff, Established, HostSession};
use crate::state::{ClientStateMachine, HandshakeInput, HandshakeState};
use crate::transport::{ChannelConnection, ChannelConnector, SessionApi};

/// Exponential reconnect schedule for the channel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Connection attempts before giving up
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(4),
            attempts: 5,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (zero based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub create_timeout: Duration,
    pub redirect_delay: Duration,
    /// Lifetime assumed for codes delivered by `qr-code-refreshed`
    pub session_ttl: Duration,
    pub backoff: Backoff,
    /// Identity the session is bound to; unique per client instance
    pub client_session_id: String,
    pub device_metadata: String,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for HandshakeOptions {
    fn from(config: &Config) -> Self {
        Self {
            create_timeout: config.create_timeout(),
            redirect_delay: config.redirect_delay(),
            session_ttl: config.session_ttl(),
            backoff: Backoff::default(),
            client_session_id: format!("web-session-{}", Uuid::new_v4().simple()),
            device_metadata: String::new(),
        }
    }
}

/// Commands accepted from the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeCommand {
    /// Start a new attempt; only honored in `expired` or `error`
    Retry,
    /// Tear everything down
    Unmount,
}

/// What the UI renders
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeView {
    pub state: HandshakeState,
    pub attempt: u64,
    pub token: Option<String>,
    pub renderable_code: Option<String>,
    pub message_key: &'static str,
}

impl From<&ClientStateMachine> for HandshakeView {
    fn from(machine: &ClientStateMachine) -> Self {
        Self {
            state: machine.state(),
            attempt: machine.attempt(),
            token: machine.token().map(str::to_string),
            renderable_code: machine.renderable_code().map(str::to_string),
            message_key: machine.message_key(),
        }
    }
}

/// UI side of a running handshake
#[derive(Debug, Clone)]
pub struct HandshakeHandle {
    view: watch::Receiver<HandshakeView>,
    commands: mpsc::UnboundedSender<HandshakeCommand>,
}

impl HandshakeHandle {
    /// Latest published view
    pub fn view(&self) -> HandshakeView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HandshakeView> {
        self.view.clone()
    }

    /// Wait until the view satisfies `f`; `None` once the driver is gone and
    /// the last view does not match
    pub async fn wait_for(
        &mut self,
        f: impl FnMut(&HandshakeView) -> bool,
    ) -> Option<HandshakeView> {
        self.view.wait_for(f).await.ok().map(|view| view.clone())
    }

    pub fn retry(&self) {
        let _ = self.commands.send(HandshakeCommand::Retry);
    }

    pub fn unmount(&self) {
        let _ = self.commands.send(HandshakeCommand::Unmount);
    }
}

/// How the driver finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Authenticated(Established),
    Unmounted,
}

enum AttemptEnd {
    Authenticated(Established),
    /// Ended in `expired` or `error`
    Failed,
    Unmounted,
}

enum Signal {
    Frame(Option<ChannelFrame>),
    Deadline,
    Command(Option<HandshakeCommand>),
}

/// Drives one mounted login handshake
pub struct Handshake<A, C, H: HostSession> {
    api: Arc<A>,
    connector: Arc<C>,
    host: Arc<H>,
    options: HandshakeOptions,
    machine: ClientStateMachine,
    view: watch::Sender<HandshakeView>,
    commands: mpsc::UnboundedReceiver<HandshakeCommand>,
}

impl<A, C, H> Handshake<A, C, H>
where
    A: SessionApi + 'static,
    C: ChannelConnector + 'static,
    H: HostSession,
{
    pub fn new(
        api: Arc<A>,
        connector: Arc<C>,
        host: Arc<H>,
        options: HandshakeOptions,
    ) -> (Self, HandshakeHandle) {
        let machine = ClientStateMachine::new();
        let (view_tx, view_rx) = watch::channel(HandshakeView::from(&machine));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handshake = Self {
            api,
            connector,
            host,
            options,
            machine,
            view: view_tx,
            commands: command_rx,
        };
        let handle = HandshakeHandle {
            view: view_rx,
            commands: command_tx,
        };
        (handshake, handle)
    }

    /// Run attempts until one authenticates or the UI unmounts
    pub async fn run(mut self) -> HandshakeOutcome {
        loop {
            match self.run_attempt().await {
                AttemptEnd::Authenticated(established) => {
                    return HandshakeOutcome::Authenticated(established)
                }
                AttemptEnd::Unmounted => {
                    info!("Handshake unmounted in state {:?}", self.machine.state());
                    return HandshakeOutcome::Unmounted;
                }
                AttemptEnd::Failed => {
                    if !self.wait_for_retry().await {
                        return HandshakeOutcome::Unmounted;
                    }
                    self.apply(HandshakeInput::Retry);
                }
            }
        }
    }

    async fn run_attempt(&mut self) -> AttemptEnd {
        let attempt = self.machine.attempt();
        let mut handoff =
            CredentialHandoff::new(Arc::clone(&self.host), attempt, self.options.redirect_delay);

        let request = CreateSessionRequest {
            client_session_id: self.options.client_session_id.clone(),
            device_metadata: self.options.device_metadata.clone(),
        };
        let timeout = self.options.create_timeout;
        debug!("Attempt {}: requesting QR session", attempt);

        // Losing the race against the timeout or an unmount drops the
        // request future, which cancels the request itself.
        let creation = tokio::time::timeout(timeout, self.api.create_session(request));
        let result = or_unmount(&mut self.commands, creation).await;
        let created = match result {
            None => return AttemptEnd::Unmounted,
            Some(Ok(Ok(created))) => created,
            Some(Ok(Err(err))) => {
                warn!("QR session creation failed: {}", err);
                self.apply(HandshakeInput::CreationFailed(err));
                return AttemptEnd::Failed;
            }
            Some(Err(_)) => {
                warn!("QR session creation timed out after {:?}", timeout);
                self.apply(HandshakeInput::CreationFailed(Error::CreationTimeout(
                    timeout.as_millis() as u64,
                )));
                return AttemptEnd::Failed;
            }
        };

        let deadline = Instant::now() + Duration::from_secs(created.expires_in);
        let token = created.token.clone();
        self.apply(HandshakeInput::SessionCreated {
            token: created.token,
            renderable_code: created.renderable_code,
        });

        let connecting = connect_with_backoff(
            self.connector.as_ref(),
            self.options.backoff,
            &token,
            &self.options.client_session_id,
        );
        let result = or_unmount(&mut self.commands, connecting).await;
        let conn = match result {
            None => return AttemptEnd::Unmounted,
            Some(Ok(conn)) => conn,
            Some(Err(err)) => {
                warn!("Could not subscribe to QR session: {}", err);
                self.apply(HandshakeInput::ChannelFailed(err));
                return AttemptEnd::Failed;
            }
        };

        self.listen(conn, deadline, &mut handoff).await
    }

    async fn listen(
        &mut self,
        mut conn: Box<dyn ChannelConnection>,
        mut deadline: Instant,
        handoff: &mut CredentialHandoff<H>,
    ) -> AttemptEnd {
        loop {
            let signal = tokio::select! {
                frame = conn.next_frame() => Signal::Frame(frame),
                _ = tokio::time::sleep_until(deadline) => Signal::Deadline,
                command = self.commands.recv() => Signal::Command(command),
            };

            match signal {
                Signal::Command(Some(HandshakeCommand::Retry)) => {
                    debug!("Ignoring retry while listening");
                }
                Signal::Command(Some(HandshakeCommand::Unmount) | None) => {
                    self.release(conn).await;
                    return AttemptEnd::Unmounted;
                }
                Signal::Deadline => {
                    info!("QR code expired locally");
                    self.apply(HandshakeInput::LocalExpiry);
                    self.release(conn).await;
                    return AttemptEnd::Failed;
                }
                Signal::Frame(None) => {
                    let Some(token) = self.machine.token().map(str::to_string) else {
                        return AttemptEnd::Failed;
                    };
                    warn!("Channel connection lost, reconnecting");
                    let reconnecting = connect_with_backoff(
                        self.connector.as_ref(),
                        self.options.backoff,
                        &token,
                        &self.options.client_session_id,
                    );
                    // The code still expires on time while we reconnect
                    let bounded = tokio::time::timeout_at(deadline, reconnecting);
                    let result = or_unmount(&mut self.commands, bounded).await;
                    match result {
                        None => return AttemptEnd::Unmounted,
                        Some(Err(_)) => {
                            info!("QR code expired locally while reconnecting");
                            self.apply(HandshakeInput::LocalExpiry);
                            return AttemptEnd::Failed;
                        }
                        Some(Ok(Ok(fresh))) => conn = fresh,
                        Some(Ok(Err(err))) => {
                            warn!("Giving up on channel connection: {}", err);
                            self.apply(HandshakeInput::ChannelFailed(err));
                            return AttemptEnd::Failed;
                        }
                    }
                }
                Signal::Frame(Some(frame)) => {
                    if let Some(end) = self.on_frame(&mut conn, frame, &mut deadline, handoff).await
                    {
                        self.release(conn).await;
                        return end;
                    }
                }
            }
        }
    }

    /// Handle one frame; `Some` ends the attempt
    async fn on_frame(
        &mut self,
        conn: &mut Box<dyn ChannelConnection>,
        frame: ChannelFrame,
        deadline: &mut Instant,
        handoff: &mut CredentialHandoff<H>,
    ) -> Option<AttemptEnd> {
        let current = self.machine.token().map(str::to_string);
        if let Some(token) = &frame.token {
            if current.as_deref() != Some(token.as_str()) {
                debug!("Ignoring {:?} for stale token", frame.event);
                return None;
            }
        }

        match frame.event {
            ChannelEvent::Ping { .. } => None,
            ChannelEvent::Error { message } => {
                warn!("Channel reported an error: {}", message);
                self.apply(HandshakeInput::ChannelFailed(Error::Protocol(message)));
                Some(AttemptEnd::Failed)
            }
            ChannelEvent::QrStatusUpdate { status } => {
                let input = match status {
                    StatusUpdate::Scanned => HandshakeInput::Scanned,
                    StatusUpdate::Expired => HandshakeInput::Expired,
                    StatusUpdate::Cancelled => HandshakeInput::Cancelled,
                };
                match self.apply(input) {
                    Some(state) if state.is_recoverable() => Some(AttemptEnd::Failed),
                    _ => None,
                }
            }
            ChannelEvent::QrAuthSuccess { credential } => {
                let accepted = match credential {
                    Some(credential) => match handoff.finalize(&credential) {
                        Ok(_) => Some(credential),
                        Err(err) => {
                            warn!("Rejected delivered credential: {}", err);
                            None
                        }
                    },
                    None => None,
                };
                self.apply(HandshakeInput::AuthSucceeded(accepted));
                // Ending the attempt here leaves any duplicate delivery unread
                Some(match handoff.established() {
                    Some(established) => AttemptEnd::Authenticated(established.clone()),
                    None => AttemptEnd::Failed,
                })
            }
            ChannelEvent::QrCodeRefreshed {
                renderable_code,
                token,
            } => {
                // A scanned code is not swapped; the issuer follows the
                // refresh with an expiry for the old token
                if self.machine.state() != HandshakeState::Waiting {
                    debug!("Ignoring code refresh in state {:?}", self.machine.state());
                    return None;
                }
                // Join the replacement before leaving the old token so no
                // event falls between the two subscriptions.
                if let Err(err) = conn.join(&token, &self.options.client_session_id).await {
                    self.apply(HandshakeInput::ChannelFailed(err));
                    return Some(AttemptEnd::Failed);
                }
                if let Some(old) = &current {
                    if let Err(err) = conn.leave(old).await {
                        debug!("Leaving refreshed token failed: {}", err);
                    }
                }
                info!("QR code refreshed");
                self.apply(HandshakeInput::CodeRefreshed {
                    token,
                    renderable_code,
                });
                *deadline = Instant::now() + self.options.session_ttl;
                None
            }
        }
    }

    /// Wait in `expired`/`error` for the user; false on unmount
    async fn wait_for_retry(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(HandshakeCommand::Retry) => return true,
                Some(HandshakeCommand::Unmount) | None => return false,
            }
        }
    }

    /// Leave the current token and drop the connection
    async fn release(&self, conn: Box<dyn ChannelConnection>) {
        release(conn, self.machine.token().map(str::to_string)).await;
    }

    fn apply(&mut self, input: HandshakeInput) -> Option<HandshakeState> {
        match self.machine.apply(input) {
            Ok(state) => {
                debug!("Handshake moved to {:?}", state);
                self.view.send_replace(HandshakeView::from(&self.machine));
                Some(state)
            }
            Err(rejected) => {
                debug!("Absorbed {}", rejected);
                None
            }
        }
    }
}

async fn release(mut conn: Box<dyn ChannelConnection>, token: Option<String>) {
    if let Some(token) = token {
        if let Err(err) = conn.leave(&token).await {
            debug!("Leave on release failed: {}", err);
        }
    }
}

/// Race `work` against the command queue; `None` means unmount
async fn or_unmount<F: Future>(
    commands: &mut mpsc::UnboundedReceiver<HandshakeCommand>,
    work: F,
) -> Option<F::Output> {
    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return Some(output),
            command = commands.recv() => match command {
                Some(HandshakeCommand::Retry) => debug!("Ignoring retry while busy"),
                Some(HandshakeCommand::Unmount) | None => return None,
            },
        }
    }
}

/// Connect and join `token`, retrying on the backoff schedule
async fn connect_with_backoff<C: ChannelConnector + ?Sized>(
    connector: &C,
    backoff: Backoff,
    token: &str,
    client_session_id: &str,
) -> Result<Box<dyn ChannelConnection>> {
    let mut last = Error::Connection("no connection attempts".to_string());
    for attempt in 0..backoff.attempts {
        if attempt > 0 {
            tokio::time::sleep(backoff.delay(attempt - 1)).await;
        }
        let joined = match connector.connect().await {
            Ok(mut conn) => conn.join(token, client_session_id).await.map(|_| conn),
            Err(err) => Err(err),
        };
        match joined {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                debug!("Channel attempt {} failed: {}", attempt + 1, err);
                last = err;
            }
        }
    }
    Err(match last {
        Error::Connection(message) => Error::Connection(message),
        other => Error::Connection(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::tests::RecordingHost;
    use crate::handoff::PostAuthAction;
    use async_trait::async_trait;
    use qrgate_core::protocol::CreateSessionResponse;
    use qrgate_core::Credential;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Reply {
        Grant(&'static str),
        /// Grant with a custom lifetime in seconds
        GrantFor(&'static str, u64),
        Fail(Error),
        Hang,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockApi {
        replies: Mutex<VecDeque<Reply>>,
        dropped: Arc<AtomicBool>,
    }

    impl MockApi {
        fn with(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl SessionApi for MockApi {
        async fn create_session(
            &self,
            _request: CreateSessionRequest,
        ) -> Result<CreateSessionResponse> {
            let reply = self.replies.lock().unwrap().pop_front();
            let grant = |token: &str, expires_in| CreateSessionResponse {
                token: token.to_string(),
                renderable_code: format!("data:image/png;base64,{}", token),
                expires_in,
            };
            match reply {
                Some(Reply::Grant(token)) => Ok(grant(token, 120)),
                Some(Reply::GrantFor(token, expires_in)) => Ok(grant(token, expires_in)),
                Some(Reply::Fail(err)) => Err(err),
                Some(Reply::Hang) => {
                    let _guard = DropFlag(Arc::clone(&self.dropped));
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                None => Err(Error::Network("no reply queued".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct MockConnector {
        connections: Mutex<VecDeque<mpsc::UnboundedReceiver<ChannelFrame>>>,
        log: Arc<Mutex<Vec<String>>>,
        /// Client ids presented on every join
        joined_as: Arc<Mutex<Vec<String>>>,
        /// Frames handed to the driver
        delivered: Arc<AtomicUsize>,
    }

    impl MockConnector {
        /// Queue a connection and return the server side of it
        fn accept(&self) -> mpsc::UnboundedSender<ChannelFrame> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.connections.lock().unwrap().push_back(rx);
            tx
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn connects(&self) -> usize {
            self.log().iter().filter(|entry| *entry == "connect").count()
        }

        fn joined_as(&self) -> Vec<String> {
            self.joined_as.lock().unwrap().clone()
        }

        fn delivered(&self) -> usize {
            self.delivered.load(Ordering::SeqCst)
        }
    }

    struct MockConnection {
        frames: mpsc::UnboundedReceiver<ChannelFrame>,
        log: Arc<Mutex<Vec<String>>>,
        joined_as: Arc<Mutex<Vec<String>>>,
        delivered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChannelConnector for MockConnector {
        async fn connect(&self) -> Result<Box<dyn ChannelConnection>> {
            self.log.lock().unwrap().push("connect".to_string());
            let frames = self
                .connections
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Connection("refused".to_string()))?;
            Ok(Box::new(MockConnection {
                frames,
                log: Arc::clone(&self.log),
                joined_as: Arc::clone(&self.joined_as),
                delivered: Arc::clone(&self.delivered),
            }))
        }
    }

    #[async_trait]
    impl ChannelConnection for MockConnection {
        async fn join(&mut self, token: &str, client_session_id: &str) -> Result<()> {
            self.log.lock().unwrap().push(format!("join:{}", token));
            self.joined_as
                .lock()
                .unwrap()
                .push(client_session_id.to_string());
            Ok(())
        }

        async fn leave(&mut self, token: &str) -> Result<()> {
            self.log.lock().unwrap().push(format!("leave:{}", token));
            Ok(())
        }

        async fn next_frame(&mut self) -> Option<ChannelFrame> {
            let frame = self.frames.recv().await;
            if frame.is_some() {
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
            frame
        }
    }

    fn status(token: &str, status: StatusUpdate) -> ChannelFrame {
        ChannelFrame::for_token(token, ChannelEvent::status(status))
    }

    fn success(token: &str, credential: Option<&str>) -> ChannelFrame {
        ChannelFrame::for_token(
            token,
            ChannelEvent::QrAuthSuccess {
                credential: credential.map(Credential::new),
            },
        )
    }

    fn start(
        api: Arc<MockApi>,
        connector: Arc<MockConnector>,
        host: Arc<RecordingHost>,
    ) -> (tokio::task::JoinHandle<HandshakeOutcome>, HandshakeHandle) {
        let (handshake, handle) = Handshake::new(api, connector, host, HandshakeOptions::default());
        (tokio::spawn(handshake.run()), handle)
    }

    async fn reach(handle: &mut HandshakeHandle, state: HandshakeState) -> HandshakeView {
        tokio::time::timeout(Duration::from_secs(600), handle.wait_for(|v| v.state == state))
            .await
            .expect("state not reached")
            .expect("driver stopped")
    }

    #[test]
    fn test_backoff_schedule() {
        let backoff = Backoff::default();
        let delays: Vec<_> = (0..6).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 4000]);
    }

    #[test]
    fn test_default_client_ids_are_unique() {
        let a = HandshakeOptions::default();
        let b = HandshakeOptions::default();
        assert!(a.client_session_id.starts_with("web-session-"));
        assert_ne!(a.client_session_id, b.client_session_id);
    }

    #[tokio::test]
    async fn test_scan_then_authenticate() {
        let api = MockApi::with(vec![Reply::Grant("abc123")]);
        let connector = Arc::new(MockConnector::default());
        let server = connector.accept();
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector.clone(), host.clone());

        let view = reach(&mut handle, HandshakeState::Waiting).await;
        assert_eq!(view.token.as_deref(), Some("abc123"));
        assert_eq!(view.message_key, "scan_qr_with_app");

        server.send(status("abc123", StatusUpdate::Scanned)).unwrap();
        reach(&mut handle, HandshakeState::Scanned).await;

        server.send(success("abc123", Some("xyz"))).unwrap();
        let outcome = task.await.unwrap();
        assert_eq!(
            outcome,
            HandshakeOutcome::Authenticated(Established {
                attempt: 1,
                action: PostAuthAction::Redirect("/".to_string()),
            })
        );
        assert_eq!(handle.view().state, HandshakeState::Authenticated);
        assert_eq!(
            host.sessions.lock().unwrap().as_slice(),
            &[Credential::new("xyz")]
        );
        assert_eq!(
            connector.log(),
            vec!["connect", "join:abc123", "leave:abc123"]
        );
    }

    #[tokio::test]
    async fn test_expiry_then_retry_issues_new_token() {
        let api = MockApi::with(vec![Reply::Grant("abc123"), Reply::Grant("def456")]);
        let connector = Arc::new(MockConnector::default());
        let first = connector.accept();
        let _second = connector.accept();
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector.clone(), host.clone());

        reach(&mut handle, HandshakeState::Waiting).await;
        first.send(status("abc123", StatusUpdate::Expired)).unwrap();
        let view = reach(&mut handle, HandshakeState::Expired).await;
        assert_eq!(view.message_key, "qr_code_expired");

        handle.retry();
        let view = handle
            .wait_for(|v| v.state == HandshakeState::Waiting && v.attempt == 2)
            .await
            .unwrap();
        assert_eq!(view.token.as_deref(), Some("def456"));

        handle.unmount();
        assert_eq!(task.await.unwrap(), HandshakeOutcome::Unmounted);
        assert_eq!(
            connector.log(),
            vec![
                "connect",
                "join:abc123",
                "leave:abc123",
                "connect",
                "join:def456",
                "leave:def456"
            ]
        );
        assert_eq!(host.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_timeout_drops_request() {
        let api = MockApi::with(vec![Reply::Hang]);
        let connector = Arc::new(MockConnector::default());
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api.clone(), connector.clone(), host);

        let view = reach(&mut handle, HandshakeState::Error).await;
        assert_eq!(view.message_key, "qr_request_timed_out");
        assert!(api.dropped.load(Ordering::SeqCst));
        assert_eq!(connector.connects(), 0);

        handle.unmount();
        assert_eq!(task.await.unwrap(), HandshakeOutcome::Unmounted);
    }

    #[tokio::test]
    async fn test_creation_failure_is_error() {
        let api = MockApi::with(vec![Reply::Fail(Error::Network("refused".to_string()))]);
        let connector = Arc::new(MockConnector::default());
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector, host);

        let view = reach(&mut handle, HandshakeState::Error).await;
        assert_eq!(view.message_key, "qr_generation_failed");
        drop(handle);
        assert_eq!(task.await.unwrap(), HandshakeOutcome::Unmounted);
    }

    #[tokio::test]
    async fn test_refresh_joins_before_leaving() {
        let api = MockApi::with(vec![Reply::Grant("abc123")]);
        let connector = Arc::new(MockConnector::default());
        let server = connector.accept();
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector.clone(), host);

        reach(&mut handle, HandshakeState::Waiting).await;
        server
            .send(ChannelFrame::for_token(
                "abc123",
                ChannelEvent::QrCodeRefreshed {
                    renderable_code: "data:def456".to_string(),
                    token: "def456".to_string(),
                },
            ))
            .unwrap();
        let view = handle
            .wait_for(|v| v.token.as_deref() == Some("def456"))
            .await
            .unwrap();
        assert_eq!(view.state, HandshakeState::Waiting);
        assert_eq!(view.attempt, 1);
        assert_eq!(view.renderable_code.as_deref(), Some("data:def456"));

        // A late expiry for the replaced token must not end the attempt
        server.send(status("abc123", StatusUpdate::Expired)).unwrap();
        server.send(status("def456", StatusUpdate::Scanned)).unwrap();
        reach(&mut handle, HandshakeState::Scanned).await;

        handle.unmount();
        assert_eq!(task.await.unwrap(), HandshakeOutcome::Unmounted);
        assert_eq!(
            connector.log(),
            vec![
                "connect",
                "join:abc123",
                "join:def456",
                "leave:abc123",
                "leave:def456"
            ]
        );

        // The replacement is joined under the same client identity
        let ids = connector.joined_as();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
        assert!(ids[0].starts_with("web-session-"));
    }

    #[tokio::test]
    async fn test_refresh_while_scanned_ends_in_expired() {
        let api = MockApi::with(vec![Reply::Grant("abc123")]);
        let connector = Arc::new(MockConnector::default());
        let server = connector.accept();
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector.clone(), host);

        reach(&mut handle, HandshakeState::Waiting).await;
        server.send(status("abc123", StatusUpdate::Scanned)).unwrap();
        reach(&mut handle, HandshakeState::Scanned).await;

        // What the issuer emits when a scanned session is refreshed
        server
            .send(ChannelFrame::for_token(
                "abc123",
                ChannelEvent::QrCodeRefreshed {
                    renderable_code: "data:def456".to_string(),
                    token: "def456".to_string(),
                },
            ))
            .unwrap();
        server.send(status("abc123", StatusUpdate::Expired)).unwrap();

        let view = reach(&mut handle, HandshakeState::Expired).await;
        assert_eq!(view.token.as_deref(), Some("abc123"));
        assert_eq!(view.message_key, "qr_code_expired");
        assert!(!connector.log().contains(&"join:def456".to_string()));

        handle.unmount();
        assert_eq!(task.await.unwrap(), HandshakeOutcome::Unmounted);
    }

    #[tokio::test]
    async fn test_success_without_credential_is_error() {
        let api = MockApi::with(vec![Reply::Grant("abc123")]);
        let connector = Arc::new(MockConnector::default());
        let server = connector.accept();
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector.clone(), host.clone());

        reach(&mut handle, HandshakeState::Waiting).await;
        server.send(success("abc123", None)).unwrap();
        let view = reach(&mut handle, HandshakeState::Error).await;
        assert_eq!(view.message_key, "qr_auth_missing_session");
        assert_eq!(host.session_count(), 0);

        handle.unmount();
        assert_eq!(task.await.unwrap(), HandshakeOutcome::Unmounted);
        assert!(connector.log().contains(&"leave:abc123".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_expiry() {
        let api = MockApi::with(vec![Reply::Grant("abc123")]);
        let connector = Arc::new(MockConnector::default());
        let _server = connector.accept();
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector.clone(), host);

        reach(&mut handle, HandshakeState::Waiting).await;
        let started = Instant::now();
        reach(&mut handle, HandshakeState::Expired).await;
        assert!(started.elapsed() >= Duration::from_secs(119));

        handle.unmount();
        assert_eq!(task.await.unwrap(), HandshakeOutcome::Unmounted);
        assert_eq!(connector.log().last().map(String::as_str), Some("leave:abc123"));
    }

    #[tokio::test]
    async fn test_reconnect_rejoins_current_token() {
        let api = MockApi::with(vec![Reply::Grant("abc123")]);
        let connector = Arc::new(MockConnector::default());
        let first = connector.accept();
        let second = connector.accept();
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector.clone(), host);

        reach(&mut handle, HandshakeState::Waiting).await;
        drop(first);
        second.send(status("abc123", StatusUpdate::Scanned)).unwrap();
        let view = reach(&mut handle, HandshakeState::Scanned).await;
        assert_eq!(view.attempt, 1);

        handle.unmount();
        task.await.unwrap();
        assert_eq!(
            &connector.log()[..4],
            &["connect", "join:abc123", "connect", "join:abc123"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up() {
        let api = MockApi::with(vec![Reply::Grant("abc123")]);
        let connector = Arc::new(MockConnector::default());
        let first = connector.accept();
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector.clone(), host);

        reach(&mut handle, HandshakeState::Waiting).await;
        drop(first);
        let view = reach(&mut handle, HandshakeState::Error).await;
        assert_eq!(view.message_key, "websocket_connection_failed");
        assert_eq!(connector.connects(), 1 + Backoff::default().attempts as usize);

        handle.unmount();
        assert_eq!(task.await.unwrap(), HandshakeOutcome::Unmounted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_not_delayed_by_reconnect() {
        let api = MockApi::with(vec![Reply::GrantFor("abc123", 2)]);
        let connector = Arc::new(MockConnector::default());
        let first = connector.accept();
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector.clone(), host);

        reach(&mut handle, HandshakeState::Waiting).await;
        let started = Instant::now();
        drop(first);

        // The full backoff schedule would take 3.75 s; the code dies at 2 s
        let view = reach(&mut handle, HandshakeState::Expired).await;
        assert_eq!(view.message_key, "qr_code_expired");
        assert!(started.elapsed() <= Duration::from_millis(2100));
        assert!(connector.connects() < 1 + Backoff::default().attempts as usize);

        handle.unmount();
        assert_eq!(task.await.unwrap(), HandshakeOutcome::Unmounted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_success_establishes_once() {
        let api = MockApi::with(vec![Reply::Grant("abc123")]);
        let connector = Arc::new(MockConnector::default());
        let server = connector.accept();
        let host = Arc::new(RecordingHost::at("/c/general"));
        let (task, mut handle) = start(api, connector.clone(), host.clone());

        reach(&mut handle, HandshakeState::Waiting).await;
        server.send(success("abc123", Some("xyz"))).unwrap();
        server.send(success("abc123", Some("xyz"))).unwrap();
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, HandshakeOutcome::Authenticated(_)));

        // The attempt ended on the first delivery; the duplicate stays unread
        assert_eq!(connector.delivered(), 1);
        assert!(server.is_closed());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(host.session_count(), 1);
        assert_eq!(
            host.navigations.lock().unwrap().as_slice(),
            &[PostAuthAction::Reload]
        );
    }

    #[tokio::test]
    async fn test_error_frame_fails_attempt() {
        let api = MockApi::with(vec![Reply::Grant("abc123")]);
        let connector = Arc::new(MockConnector::default());
        let server = connector.accept();
        let host = Arc::new(RecordingHost::at("/login"));
        let (task, mut handle) = start(api, connector, host);

        reach(&mut handle, HandshakeState::Waiting).await;
        server
            .send(ChannelFrame::connection(ChannelEvent::Error {
                message: "Malformed message".to_string(),
            }))
            .unwrap();
        let view = reach(&mut handle, HandshakeState::Error).await;
        assert_eq!(view.message_key, "websocket_error");

        handle.unmount();
        task.await.unwrap();
    }
}
