//! Event channel to the room coordination service.
//!
//! [`EventChannel`] is a thin handle over one background connection task. The
//! task owns the transport: it connects, pumps frames both ways, and on any
//! drop retries forever with bounded exponential backoff. Everything the task
//! observes (`Connected`, `Disconnected`, decoded [`ServerEvent`]s) is
//! delivered in receipt order on the `mpsc::Receiver<ChannelEvent>` returned
//! from [`EventChannel::connect`].
//!
//! ```rust,ignore
//! let (channel, mut events) = EventChannel::connect(
//!     Arc::new(WsConnector::default()),
//!     ChannelConfig::new("ws://localhost:5001/ws"),
//! );
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ChannelEvent::Connected => channel.send(&join),
//!         ChannelEvent::Received(ev) => state.dispatch(ev),
//!         ChannelEvent::Disconnected { .. } => {}
//!     };
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{Result, RoomError};
use crate::protocol::{ClientEvent, ServerEvent};

const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Observable connectivity of an [`EventChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Whether the handshake carries the client's origin credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialsMode {
    Omit,
    #[default]
    Include,
}

/// What the connection task reports to its subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { reason: Option<String> },
    Received(ServerEvent),
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// One established bidirectional frame stream.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next text frame. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens a [`Transport`] to an endpoint. Called once per (re)connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: CredentialsMode,
    ) -> Result<Box<dyn Transport>>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    /// Sent as the `Origin` header when credentials are included.
    pub origin: Option<String>,
}

impl WsConnector {
    pub fn with_origin(origin: impl Into<String>) -> Self {
        WsConnector {
            origin: Some(origin.into()),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: CredentialsMode,
    ) -> Result<Box<dyn Transport>> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| RoomError::connection(endpoint, e))?;
        if credentials == CredentialsMode::Include {
            if let Some(origin) = &self.origin {
                let value =
                    HeaderValue::from_str(origin).map_err(|e| RoomError::connection(endpoint, e))?;
                request.headers_mut().insert("Origin", value);
            }
        }
        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RoomError::connection(endpoint, e))?;
        Ok(Box::new(WsTransport {
            endpoint: endpoint.to_string(),
            stream,
        }))
    }
}

struct WsTransport {
    endpoint: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| RoomError::connection(&self.endpoint, e))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(Ok(text)),
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Ok(_)) => continue, // binary / ping / pong
                Some(Err(e)) => return Some(Err(RoomError::connection(&self.endpoint, e))),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| RoomError::connection(&self.endpoint, e))
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Bounded exponential reconnection delay: `min(initial * 2^n, max)`,
/// optionally randomized by `±jitter`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max: max.max(initial),
            jitter: 0.0,
            attempt: 0,
        }
    }

    /// Randomization factor, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        let base = self.initial.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let secs = (base.as_secs_f64() * (1.0 + spread)).max(0.0);
        Duration::from_secs_f64(secs).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: String,
    pub credentials: CredentialsMode,
    /// First reconnection delay (default 1 s).
    pub reconnect_delay: Duration,
    /// Reconnection delay cap (default 5 s).
    pub reconnect_delay_max: Duration,
    pub reconnect_jitter: f64,
    pub event_capacity: usize,
    /// How long [`EventChannel::close`] waits before aborting the task.
    pub close_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        ChannelConfig {
            endpoint: endpoint.into(),
            credentials: CredentialsMode::Include,
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(5),
            reconnect_jitter: 0.0,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.reconnect_delay_max = max;
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_delay, self.reconnect_delay_max)
            .with_jitter(self.reconnect_jitter)
    }
}

// ---------------------------------------------------------------------------
// EventChannel
// ---------------------------------------------------------------------------

/// Handle to the background connection task.
pub struct EventChannel {
    endpoint: String,
    cmd_tx: mpsc::UnboundedSender<String>,
    status_rx: watch::Receiver<ConnectionStatus>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    close_timeout: Duration,
    closed: bool,
}

impl EventChannel {
    /// Spawn the connection task and return the handle plus the ordered
    /// event stream. Connection failures never surface here; they show up as
    /// `Disconnected` events and status.
    pub fn connect(
        connector: Arc<dyn Connector>,
        config: ChannelConfig,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let endpoint = config.endpoint.clone();
        let close_timeout = config.close_timeout;
        let task = tokio::spawn(connection_loop(
            connector,
            config,
            cmd_rx,
            event_tx,
            status_tx,
            shutdown_rx,
        ));

        let channel = EventChannel {
            endpoint,
            cmd_tx,
            status_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            close_timeout,
            closed: false,
        };
        (channel, event_rx)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.closed {
            return ConnectionStatus::Disconnected;
        }
        *self.status_rx.borrow()
    }

    /// A receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Fire-and-forget. Returns `false` (and does nothing) unless connected.
    pub fn send(&self, event: &ClientEvent) -> bool {
        if self.status() != ConnectionStatus::Connected {
            debug!(event = event.name(), "channel not connected, send skipped");
            return false;
        }
        match event.to_frame() {
            Ok(frame) => self.cmd_tx.send(frame).is_ok(),
            Err(e) => {
                error!(event = event.name(), error = %e, "failed to encode event");
                false
            }
        }
    }

    /// Flush accepted frames, close the transport and stop reconnecting.
    pub async fn close(&mut self) {
        self.closed = true;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(self.close_timeout, &mut task).await.is_err() {
                warn!(endpoint = %self.endpoint, "connection task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

enum PumpExit {
    Shutdown,
    Dropped(Option<String>),
}

async fn connection_loop(
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<String>,
    event_tx: mpsc::Sender<ChannelEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut backoff = config.backoff();
    debug!(endpoint = %config.endpoint, "connection loop started");

    loop {
        let _ = status_tx.send(ConnectionStatus::Connecting);
        let attempt = tokio::select! {
            _ = &mut shutdown_rx => break,
            res = connector.connect(&config.endpoint, config.credentials) => res,
        };

        match attempt {
            Ok(mut transport) => {
                backoff.reset();
                // Frames accepted for a previous connection are stale.
                while cmd_rx.try_recv().is_ok() {}
                let _ = status_tx.send(ConnectionStatus::Connected);
                info!(endpoint = %config.endpoint, "channel connected");
                emit(&event_tx, ChannelEvent::Connected).await;

                match pump(transport.as_mut(), &mut cmd_rx, &event_tx, &mut shutdown_rx).await {
                    PumpExit::Shutdown => {
                        if let Err(e) = transport.close().await {
                            debug!(error = %e, "transport close failed");
                        }
                        break;
                    }
                    PumpExit::Dropped(reason) => {
                        let _ = status_tx.send(ConnectionStatus::Disconnected);
                        warn!(
                            endpoint = %config.endpoint,
                            reason = reason.as_deref().unwrap_or("closed by peer"),
                            "channel dropped, will reconnect"
                        );
                        emit(&event_tx, ChannelEvent::Disconnected { reason }).await;
                    }
                }
            }
            Err(e) => {
                let _ = status_tx.send(ConnectionStatus::Disconnected);
                warn!(error = %e, attempt = backoff.attempts(), "connect failed, will retry");
                emit(
                    &event_tx,
                    ChannelEvent::Disconnected {
                        reason: Some(e.to_string()),
                    },
                )
                .await;
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let _ = status_tx.send(ConnectionStatus::Disconnected);
    debug!(endpoint = %config.endpoint, "connection loop exited");
}

async fn pump(
    transport: &mut dyn Transport,
    cmd_rx: &mut mpsc::UnboundedReceiver<String>,
    event_tx: &mpsc::Sender<ChannelEvent>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> PumpExit {
    loop {
        tokio::select! {
            biased;

            _ = &mut *shutdown_rx => {
                while let Ok(frame) = cmd_rx.try_recv() {
                    if transport.send(frame).await.is_err() {
                        break;
                    }
                }
                return PumpExit::Shutdown;
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(frame) => {
                    if let Err(e) = transport.send(frame).await {
                        return PumpExit::Dropped(Some(e.to_string()));
                    }
                }
                None => return PumpExit::Shutdown,
            },

            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => match ServerEvent::from_frame(&text) {
                    Ok(event) => {
                        debug!(event = event.name(), "event received");
                        emit(event_tx, ChannelEvent::Received(event)).await;
                    }
                    Err(e) => warn!(error = %e, "undecodable frame skipped"),
                },
                Some(Err(e)) => return PumpExit::Dropped(Some(e.to_string())),
                None => return PumpExit::Dropped(None),
            },
        }
    }
}

async fn emit(event_tx: &mpsc::Sender<ChannelEvent>, event: ChannelEvent) {
    if event_tx.send(event).await.is_err() {
        debug!("event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    type Script = Vec<Option<Result<String>>>;

    struct MockTransport {
        incoming: VecDeque<Option<Result<String>>>,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, frame: String) -> Result<()> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            match self.incoming.pop_front() {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Hands out one scripted transport per connect; `Err` entries fail.
    struct ScriptedConnector {
        scripts: StdMutex<VecDeque<std::result::Result<Script, String>>>,
        sent: Arc<StdMutex<Vec<String>>>,
        attempts: Arc<StdMutex<u32>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<std::result::Result<Script, String>>) -> Self {
            ScriptedConnector {
                scripts: StdMutex::new(VecDeque::from(scripts)),
                sent: Arc::new(StdMutex::new(Vec::new())),
                attempts: Arc::new(StdMutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            endpoint: &str,
            _credentials: CredentialsMode,
        ) -> Result<Box<dyn Transport>> {
            *self.attempts.lock().unwrap() += 1;
            let next = self.scripts.lock().unwrap().pop_front();
            match next {
                Some(Ok(script)) => Ok(Box::new(MockTransport {
                    incoming: VecDeque::from(script),
                    sent: Arc::clone(&self.sent),
                })),
                Some(Err(detail)) => Err(RoomError::connection(endpoint, detail)),
                None => std::future::pending().await,
            }
        }
    }

    fn fast_config() -> ChannelConfig {
        ChannelConfig::new("ws://test/ws")
            .with_reconnect_delays(Duration::from_millis(1), Duration::from_millis(5))
    }

    // -- Backoff -------------------------------------------------------------

    #[test]
    fn test_backoff_schedule_doubles_then_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5, 5]);
    }

    #[test]
    fn test_backoff_reset_restarts_schedule() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_within_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5)).with_jitter(0.5);
        for _ in 0..50 {
            let d = b.next_delay();
            assert!(d <= Duration::from_secs(5), "delay above cap: {:?}", d);
        }
    }

    #[test]
    fn test_backoff_many_attempts_does_not_overflow() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        for _ in 0..100 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_nan_jitter_is_disabled() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5)).with_jitter(f64::NAN);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_channel_config_defaults() {
        let cfg = ChannelConfig::new("ws://x");
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(1));
        assert_eq!(cfg.reconnect_delay_max, Duration::from_secs(5));
        assert_eq!(cfg.credentials, CredentialsMode::Include);
    }

    // -- EventChannel --------------------------------------------------------

    #[tokio::test]
    async fn test_connected_is_first_event() {
        let connector = Arc::new(ScriptedConnector::new(vec![Ok(vec![])]));
        let (mut channel, mut events) = EventChannel::connect(connector, fast_config());
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        assert_eq!(channel.status(), ConnectionStatus::Connected);
        channel.close().await;
    }

    #[tokio::test]
    async fn test_received_frames_are_decoded_in_order() {
        let script = vec![
            Some(Ok(r#"{"event":"user_joined","data":{"username":"bob"}}"#.to_string())),
            Some(Ok("not json".to_string())),
            Some(Ok(r#"{"event":"user_left","data":{"username":"bob"}}"#.to_string())),
        ];
        let connector = Arc::new(ScriptedConnector::new(vec![Ok(script)]));
        let (mut channel, mut events) = EventChannel::connect(connector, fast_config());
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Received(ServerEvent::UserJoined { username: "bob".into() }))
        );
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Received(ServerEvent::UserLeft { username: "bob".into() }))
        );
        channel.close().await;
    }

    #[tokio::test]
    async fn test_send_is_noop_while_not_connected() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let sent = Arc::clone(&connector.sent);
        let (mut channel, _events) = EventChannel::connect(connector, fast_config());
        let ev = ClientEvent::Join { room: "r".into(), username: "u".into() };
        assert!(!channel.send(&ev));
        channel.close().await;
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_reports_disconnected_and_retries() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Err("refused".into()),
            Ok(vec![]),
        ]));
        let attempts = Arc::clone(&connector.attempts);
        let (mut channel, mut events) = EventChannel::connect(connector, fast_config());
        match events.recv().await {
            Some(ChannelEvent::Disconnected { reason }) => {
                assert!(reason.unwrap().contains("refused"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        assert_eq!(*attempts.lock().unwrap(), 2);
        channel.close().await;
    }

    #[tokio::test]
    async fn test_dropped_connection_reconnects() {
        let connector = Arc::new(ScriptedConnector::new(vec![Ok(vec![None]), Ok(vec![])]));
        let (mut channel, mut events) = EventChannel::connect(connector, fast_config());
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        assert_eq!(events.recv().await, Some(ChannelEvent::Disconnected { reason: None }));
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        channel.close().await;
    }

    #[tokio::test]
    async fn test_close_flushes_frames_sent_before_it() {
        let connector = Arc::new(ScriptedConnector::new(vec![Ok(vec![])]));
        let sent = Arc::clone(&connector.sent);
        let (mut channel, mut events) = EventChannel::connect(connector, fast_config());
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        let leave = ClientEvent::Leave { room: "r".into(), username: "u".into() };
        assert!(channel.send(&leave));
        channel.close().await;
        let frames = sent.lock().unwrap().clone();
        assert_eq!(frames, vec![leave.to_frame().unwrap()]);
        assert_eq!(channel.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_double_close_does_not_panic() {
        let connector = Arc::new(ScriptedConnector::new(vec![Ok(vec![])]));
        let (mut channel, _events) = EventChannel::connect(connector, fast_config());
        channel.close().await;
        channel.close().await;
        assert_eq!(channel.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_connection_status_display() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
    }
}
