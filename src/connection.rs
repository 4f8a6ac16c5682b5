//! Push-channel connection manager.
//!
//! Owns one authenticated push channel and its lifecycle, and composes the
//! [`HeartbeatMonitor`], [`ReconnectPolicy`] and [`Dispatcher`] around it. The
//! manager is an explicit object: whoever composes the application creates it
//! and hands clones to consumers, so tests can run several isolated instances.
//!
//! # Architecture
//!
//! ```text
//!   ConnectionManager (clone)          background task (one per attempt)
//!         │                                     │
//!         │ connect() ──── spawn ─────────────► │ Connector::open(url)
//!         │                                     │ select! {
//!         │ send(frame) ── Command::Frame ────► │   reader.recv() → Dispatcher
//!         │ close(code) ── Command::Close ────► │   commands     → writer
//!         │                                     │ }
//!         │ ◄──── handle_open / handle_closed ──│
//!         ▼
//!   watch<ConnectionState>, broadcast<LifecycleEvent>
//! ```
//!
//! # State machine
//!
//! `Idle → Connecting → Open → Closing → Closed`, plus `Connecting → Closed`
//! for a failed or cancelled handshake and `Closed → Connecting` for the next
//! attempt. An unexpected close while `Open` passes through `Closing`.
//! Transitions are validated by [`ConnectionState::can_transition_to`]. A
//! transport error ends the attempt as an abnormal close that carries the
//! error as its cause.
//!
//! # Generations
//!
//! Every connect bumps a generation counter. Open/close reports from a task
//! whose generation is no longer current are ignored, so a late close of an
//! old socket never tears down a newer connection.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::constants::{
    ABNORMAL_CLOSE_CODE, HEARTBEAT_INTERVAL, LIFECYCLE_CHANNEL_CAPACITY, NORMAL_CLOSE_CODE,
    UNAUTHORIZED_CLOSE_CODE,
};
use crate::credentials::CredentialProvider;
use crate::dispatcher::{Dispatcher, Subscription};
use crate::error::ConnectionErrorKind;
use crate::heartbeat::HeartbeatMonitor;
use crate::protocol::{Envelope, EventType, OutboundFrame};
use crate::reconnect::{Backoff, ReconnectAttempt, ReconnectPolicy};
use crate::ws::{self, Connector, FrameReader, FrameWriter, TungsteniteConnector, WsMessage};

/// Lifecycle state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Channel established.
    Open,
    /// Shutdown requested or close received; not yet fully closed.
    Closing,
    /// Channel gone; may reconnect.
    Closed,
}

impl ConnectionState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Closed, Closing, Connecting, Idle, Open};
        matches!(
            (self, next),
            (Idle | Closed, Connecting)
                | (Connecting, Open | Closed)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }
}

/// Lifecycle notifications for consumers (the `onConnect`/`onDisconnect` hooks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Every state transition, in order.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// The channel opened.
    Connected,
    /// The channel closed (intentionally or not).
    Disconnected {
        /// WebSocket close code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Tunables for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// REST base URL the push-channel URL is derived from. `None` disables
    /// connecting without being an error.
    pub base_url: Option<String>,
    /// Ping interval.
    pub heartbeat_interval: Duration,
    /// Reconnect delay schedule.
    pub backoff: Backoff,
    /// Application close code meaning "credential rejected".
    pub unauthorized_close_code: u16,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            backoff: Backoff::default(),
            unauthorized_close_code: UNAUTHORIZED_CLOSE_CODE,
        }
    }
}

impl ConnectionOptions {
    /// Options for `base_url` with every other field at its default.
    pub fn for_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }
}

/// Instruction for the connection task.
#[derive(Debug)]
enum Command {
    /// Send an encoded text frame.
    Frame(String),
    /// Send a close frame and end the connection.
    Close { code: u16, reason: String },
}

/// How a connection attempt ended.
#[derive(Debug)]
struct CloseInfo {
    code: u16,
    reason: String,
    error: Option<ConnectionErrorKind>,
    intentional: bool,
}

impl CloseInfo {
    fn abnormal(reason: impl Into<String>, error: Option<ConnectionErrorKind>) -> Self {
        Self {
            code: ABNORMAL_CLOSE_CODE,
            reason: reason.into(),
            error,
            intentional: false,
        }
    }
}

/// Mutable state guarded by one lock; never held across an `.await`.
#[derive(Debug, Default)]
struct Shared {
    state: ConnectionState,
    generation: u64,
    last_error: Option<ConnectionErrorKind>,
    last_message: Option<Envelope>,
    outbound: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    options: ConnectionOptions,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    heartbeat: HeartbeatMonitor,
    reconnect: ReconnectPolicy,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("base_url", &self.options.base_url)
            .field("state", &*self.state_tx.borrow())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(shared) = self.shared.get_mut() {
            if let Some(task) = shared.task.take() {
                task.abort();
            }
        }
    }
}

/// Shared handle to one push channel.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create an idle manager using the production WebSocket connector.
    pub fn new(options: ConnectionOptions, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::with_connector(options, credentials, Arc::new(TungsteniteConnector))
    }

    /// Create an idle manager over a custom [`Connector`].
    pub fn with_connector(
        options: ConnectionOptions,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        let heartbeat = HeartbeatMonitor::new(options.heartbeat_interval);
        let reconnect = ReconnectPolicy::new(options.backoff, options.unauthorized_close_code);

        Self {
            inner: Arc::new(Inner {
                options,
                credentials,
                connector,
                dispatcher: Dispatcher::new(),
                heartbeat,
                reconnect,
                shared: Mutex::new(Shared::default()),
                state_tx,
                lifecycle_tx,
            }),
        }
    }

    /// Open the push channel.
    ///
    /// No-op when already `Open` or `Connecting`, and when no base URL is
    /// configured. Cancels any pending reconnect attempt. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionErrorKind::MissingCredential`] without attempting a
    /// connection when the provider has no credential.
    pub fn connect(&self) -> Result<(), ConnectionErrorKind> {
        let inner = &self.inner;
        inner.reconnect.cancel();

        let mut shared = inner.lock();
        if matches!(
            shared.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            log::debug!("[Connection] connect() ignored, already {:?}", shared.state);
            return Ok(());
        }

        let Some(base_url) = inner.options.base_url.as_deref() else {
            log::debug!("[Connection] No service URL configured, not connecting");
            return Ok(());
        };

        let Some(credential) = inner.credentials.credential() else {
            log::warn!("[Connection] No credential available, not connecting");
            shared.last_error = Some(ConnectionErrorKind::MissingCredential);
            return Err(ConnectionErrorKind::MissingCredential);
        };

        if shared.state == ConnectionState::Closing {
            // Previous socket still draining; abandon it.
            if let Some(task) = shared.task.take() {
                task.abort();
            }
            inner.transition(&mut shared, ConnectionState::Closed);
        }

        let url = ws::push_channel_url(base_url, &credential);
        shared.generation += 1;
        let generation = shared.generation;
        inner.transition(&mut shared, ConnectionState::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        shared.outbound = Some(tx);
        shared.task = Some(tokio::spawn(run_connection(
            Arc::downgrade(inner),
            url,
            generation,
            rx,
        )));
        Ok(())
    }

    /// Close the channel with `code` and `reason`.
    ///
    /// Stops the heartbeat and cancels any pending reconnect. An explicit
    /// close is never retried, whatever the code.
    pub fn close(&self, code: u16, reason: &str) {
        let inner = &self.inner;
        inner.reconnect.cancel();
        inner.heartbeat.stop();

        let mut shared = inner.lock();
        let state = shared.state;
        match state {
            ConnectionState::Open => {
                inner.transition(&mut shared, ConnectionState::Closing);
                let delivered = shared.outbound.as_ref().is_some_and(|tx| {
                    tx.send(Command::Close {
                        code,
                        reason: reason.to_string(),
                    })
                    .is_ok()
                });
                if !delivered {
                    shared.outbound = None;
                    shared.task = None;
                    inner.transition(&mut shared, ConnectionState::Closed);
                    drop(shared);
                    inner.emit(LifecycleEvent::Disconnected {
                        code,
                        reason: reason.to_string(),
                    });
                }
            }
            ConnectionState::Connecting => {
                if let Some(task) = shared.task.take() {
                    task.abort();
                }
                shared.outbound = None;
                inner.transition(&mut shared, ConnectionState::Closed);
                drop(shared);
                inner.emit(LifecycleEvent::Disconnected {
                    code,
                    reason: reason.to_string(),
                });
            }
            ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Closed => {
                log::debug!("[Connection] close() ignored, already {:?}", state);
            }
        }
    }

    /// Close normally (code 1000).
    pub fn disconnect(&self) {
        self.close(NORMAL_CLOSE_CODE, "client disconnect");
    }

    /// Close normally and drop every handler registered on this manager.
    pub fn teardown(&self) {
        self.disconnect();
        self.inner.dispatcher.clear();
    }

    /// Send a control frame.
    ///
    /// Returns `false` (and logs) when the channel is not open. Delivery is
    /// fire-and-forget.
    pub fn send(&self, frame: &OutboundFrame) -> bool {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!(
                    "[Connection] Failed to encode '{}' frame: {}",
                    frame.frame_type(),
                    e
                );
                return false;
            }
        };

        let shared = self.inner.lock();
        if shared.state != ConnectionState::Open {
            log::warn!(
                "[Connection] Cannot send '{}', channel is {:?}",
                frame.frame_type(),
                shared.state
            );
            return false;
        }
        shared
            .outbound
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Frame(text)).is_ok())
    }

    /// Send `{"type": frame_type, ...data}`.
    pub fn send_raw(&self, frame_type: &str, data: Value) -> bool {
        self.send(&OutboundFrame::custom(frame_type, data))
    }

    /// Register a handler for inbound events of `event_type`.
    ///
    /// Keep the returned [`Subscription`] alive for as long as the consumer
    /// wants events.
    pub fn register<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&Value, &Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.dispatcher.register(event_type, handler)
    }

    /// The dispatcher inbound frames are routed through.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether the channel is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Most recently received envelope.
    pub fn last_message(&self) -> Option<Envelope> {
        self.inner.lock().last_message.clone()
    }

    /// Most recent connection error; cleared on a successful open.
    pub fn connection_error(&self) -> Option<ConnectionErrorKind> {
        self.inner.lock().last_error.clone()
    }

    /// Reconnect bookkeeping.
    pub fn reconnect_attempt(&self) -> ReconnectAttempt {
        self.inner.reconnect.attempt()
    }

    /// Whether a reconnect attempt is scheduled.
    pub fn reconnect_pending(&self) -> bool {
        self.inner.reconnect.is_pending()
    }

    /// Whether the heartbeat loop is running.
    pub fn heartbeat_running(&self) -> bool {
        self.inner.heartbeat.is_running()
    }

    /// Watch the lifecycle state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to lifecycle events (state changes, connect, disconnect).
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.lifecycle_tx.subscribe()
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("ConnectionManager mutex poisoned")
    }

    fn transition(&self, shared: &mut Shared, next: ConnectionState) {
        let from = shared.state;
        if !from.can_transition_to(next) {
            log::error!(
                "[Connection] Refusing illegal transition {:?} -> {:?}",
                from,
                next
            );
            return;
        }
        shared.state = next;
        self.state_tx.send_replace(next);
        self.emit(LifecycleEvent::StateChanged { from, to: next });
        log::debug!("[Connection] {:?} -> {:?}", from, next);
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine.
        let _ = self.lifecycle_tx.send(event);
    }

    /// Handshake succeeded. Returns `false` if this attempt is stale.
    fn handle_open(&self, generation: u64) -> bool {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state != ConnectionState::Connecting {
            log::debug!("[Connection] Ignoring open from stale attempt {}", generation);
            return false;
        }
        self.transition(&mut shared, ConnectionState::Open);
        shared.last_error = None;
        let outbound = shared.outbound.clone();
        drop(shared);

        self.reconnect.reset();
        if let Some(tx) = outbound {
            let ping = OutboundFrame::Ping.encode().unwrap_or_else(|_| r#"{"type":"ping"}"#.to_string());
            self.heartbeat
                .start(move || tx.send(Command::Frame(ping.clone())).is_ok());
        }
        self.emit(LifecycleEvent::Connected);
        log::info!("[Connection] Push channel open");
        true
    }

    fn record_message(&self, generation: u64, envelope: Envelope) {
        let mut shared = self.lock();
        if shared.generation == generation {
            shared.last_message = Some(envelope);
        }
    }

    fn handle_closed(self: &Arc<Self>, generation: u64, info: CloseInfo) {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state == ConnectionState::Closed {
            log::debug!("[Connection] Ignoring close from stale attempt {}", generation);
            return;
        }

        let intentional = info.intentional || shared.state == ConnectionState::Closing;
        if shared.state == ConnectionState::Open {
            self.transition(&mut shared, ConnectionState::Closing);
        }
        self.transition(&mut shared, ConnectionState::Closed);
        shared.outbound = None;
        // Detach rather than abort: this runs on the task itself.
        shared.task = None;

        let unauthorized = info.code == self.options.unauthorized_close_code
            || info.error == Some(ConnectionErrorKind::Unauthorized);
        let error = if unauthorized {
            Some(ConnectionErrorKind::Unauthorized)
        } else if let Some(error) = info.error {
            Some(error)
        } else if intentional {
            None
        } else {
            Some(ConnectionErrorKind::ClosedUnexpectedly {
                code: info.code,
                reason: info.reason.clone(),
            })
        };
        if let Some(error) = &error {
            shared.last_error = Some(error.clone());
        }
        drop(shared);

        self.heartbeat.stop();
        self.emit(LifecycleEvent::Disconnected {
            code: info.code,
            reason: info.reason.clone(),
        });

        if let Some(error) = error.as_ref().filter(|e| e.is_fatal()) {
            log::error!("[Connection] Not reconnecting: {}", error);
            return;
        }
        if intentional || !self.reconnect.should_reconnect(info.code) {
            log::info!("[Connection] Closed (code {})", info.code);
            return;
        }
        if self.credentials.credential().is_none() {
            log::info!("[Connection] Closed (code {}), no credential to reconnect with", info.code);
            return;
        }

        log::warn!(
            "[Connection] Closed unexpectedly (code {}): {}",
            info.code,
            info.reason
        );
        let weak = Arc::downgrade(self);
        self.reconnect.schedule(error, move || {
            if let Some(inner) = weak.upgrade() {
                let manager = ConnectionManager { inner };
                if let Err(e) = manager.connect() {
                    log::warn!("[Reconnect] Attempt not started: {}", e);
                }
            }
        });
    }
}

/// Drive one connection attempt from handshake to close.
async fn run_connection(
    weak: Weak<Inner>,
    url: String,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let Some(connector) = weak.upgrade().map(|inner| Arc::clone(&inner.connector)) else {
        return;
    };

    log::info!("[Connection] Connecting to {}", ws::redact_token(&url));
    let opened = connector.open(&url).await;

    let Some(inner) = weak.upgrade() else {
        return;
    };
    let (mut writer, mut reader) = match opened {
        Ok(pair) => pair,
        Err(error) => {
            log::warn!("[Connection] Handshake failed: {}", error);
            let info = if error == ConnectionErrorKind::Unauthorized {
                CloseInfo {
                    code: inner.options.unauthorized_close_code,
                    reason: "unauthorized".to_string(),
                    error: Some(error),
                    intentional: false,
                }
            } else {
                CloseInfo::abnormal("handshake failed", Some(error))
            };
            inner.handle_closed(generation, info);
            return;
        }
    };

    if !inner.handle_open(generation) {
        let _ = writer.close(NORMAL_CLOSE_CODE, "superseded").await;
        return;
    }
    drop(inner);

    let info = run_message_loop(
        &weak,
        generation,
        writer.as_mut(),
        reader.as_mut(),
        &mut commands,
    )
    .await;
    if let Some(inner) = weak.upgrade() {
        inner.handle_closed(generation, info);
    }
}

/// Pump frames in both directions until the channel ends.
async fn run_message_loop(
    weak: &Weak<Inner>,
    generation: u64,
    writer: &mut dyn FrameWriter,
    reader: &mut dyn FrameReader,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> CloseInfo {
    loop {
        tokio::select! {
            msg = reader.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Some(inner) = weak.upgrade() else {
                            return CloseInfo::abnormal("manager dropped", None);
                        };
                        if let Some(envelope) = inner.dispatcher.dispatch_text(&text) {
                            inner.record_message(generation, envelope);
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = writer.send_pong(data).await;
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Connection] Closed by server (code {})", code);
                        return CloseInfo { code, reason, error: None, intentional: false };
                    }
                    Some(Ok(WsMessage::Binary(_) | WsMessage::Pong(_))) => {}
                    Some(Err(e)) => {
                        log::warn!("[Connection] Transport error: {:#}", e);
                        return CloseInfo::abnormal(
                            "transport error",
                            Some(ConnectionErrorKind::Transport(format!("{e:#}"))),
                        );
                    }
                    None => {
                        log::info!("[Connection] Stream ended without close frame");
                        return CloseInfo::abnormal("stream ended", None);
                    }
                }
            }

            command = commands.recv() => {
                match command {
                    Some(Command::Frame(text)) => {
                        if let Err(e) = writer.send_text(&text).await {
                            log::warn!("[Connection] Send failed: {:#}", e);
                            return CloseInfo::abnormal(
                                "send failed",
                                Some(ConnectionErrorKind::Transport(format!("{e:#}"))),
                            );
                        }
                    }
                    Some(Command::Close { code, reason }) => {
                        if let Err(e) = writer.close(code, &reason).await {
                            log::debug!("[Connection] Close frame not delivered: {:#}", e);
                        }
                        return CloseInfo { code, reason, error: None, intentional: true };
                    }
                    None => {
                        let _ = writer.close(NORMAL_CLOSE_CODE, "client gone").await;
                        return CloseInfo {
                            code: NORMAL_CLOSE_CODE,
                            reason: "client gone".to_string(),
                            error: None,
                            intentional: true,
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::{Closed, Closing, Connecting, Idle, Open};

    const ALL: [ConnectionState; 5] = [Idle, Connecting, Open, Closing, Closed];

    #[test]
    fn test_legal_transitions() {
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Open));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Closed.can_transition_to(Connecting));
    }

    #[test]
    fn test_no_self_transitions_or_skips() {
        for state in ALL {
            assert!(!state.can_transition_to(state), "{state:?} -> itself");
        }
        assert!(!Idle.can_transition_to(Open));
        assert!(!Open.can_transition_to(Closed));
        assert!(!Connecting.can_transition_to(Closing));
        assert!(!Open.can_transition_to(Connecting));
        assert!(!Closing.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Idle));
    }

    #[test]
    fn test_no_path_back_to_idle() {
        for state in ALL {
            assert!(!state.can_transition_to(Idle));
        }
    }

    #[test]
    fn test_default_options_match_constants() {
        let options = ConnectionOptions::default();
        assert_eq!(options.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(options.unauthorized_close_code, 4001);
        assert_eq!(options.backoff.delay_for(1), Some(Duration::from_secs(5)));
        assert!(options.base_url.is_none());
    }
}
