//! Session lifecycle: entering a room, staying in sync, leaving it.
//!
//! ```text
//! Idle ──enter()──▶ Joining ──Connected──▶ Active ──leave()──▶ Leaving ──▶ Terminated
//!                      ▲                      │
//!                      └─────Disconnected─────┘
//! ```
//!
//! A [`RoomSession`] owns one [`EventChannel`], one [`RoomSessionState`] and
//! the editor it mirrors into. It is driven from a single task: the caller
//! awaits [`RoomSession::next_update`] in a loop and interleaves user actions
//! between updates.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelConfig, ChannelEvent, Connector, ConnectionStatus, EventChannel, WsConnector};
use crate::error::{Result, RoomError};
use crate::execution::{ExecutionGateway, ExecutionResult, Executor, OutputPanel, DEFAULT_EXECUTE_URL};
use crate::identity::Identity;
use crate::language::Language;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::state::RoomSessionState;
use crate::view::RoomView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Joining,
    Active,
    Leaving,
    Terminated,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Joining => "joining",
            LifecycleState::Active => "active",
            LifecycleState::Leaving => "leaving",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Editor seam
// ---------------------------------------------------------------------------

/// An opaque text widget the session mirrors the room buffer into.
pub trait Editor: Send {
    fn text(&self) -> String;
    fn set_text(&mut self, text: &str);
}

/// Plain in-memory editor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    text: String,
    writes: usize,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the session pushed text in.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl Editor for TextBuffer {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
        self.writes += 1;
    }
}

// ---------------------------------------------------------------------------
// Execution plumbing
// ---------------------------------------------------------------------------

/// Outcome of [`RoomSession::run_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    Started { ticket: u64 },
    AlreadyRunning,
}

/// A finished execution, tagged with the ticket it was started under.
#[derive(Debug)]
pub struct ExecutionDone {
    pub ticket: u64,
    pub outcome: Result<ExecutionResult>,
}

/// What [`RoomSession::next_update`] applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Status(ConnectionStatus),
    Room(ServerEvent),
    Output(OutputPanel),
    /// The event arrived but had no effect (wrong lifecycle state or a
    /// superseded execution).
    Ignored,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct SessionBuilder {
    room_id: String,
    identity: Option<Identity>,
    connector: Option<Arc<dyn Connector>>,
    channel_config: Option<ChannelConfig>,
    executor: Option<Arc<dyn Executor>>,
    editor: Option<Box<dyn Editor>>,
}

impl SessionBuilder {
    pub fn new(room_id: impl Into<String>) -> Self {
        SessionBuilder {
            room_id: room_id.into(),
            identity: None,
            connector: None,
            channel_config: None,
            executor: None,
            editor: None,
        }
    }

    pub fn identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = Some(config);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn editor(mut self, editor: Box<dyn Editor>) -> Self {
        self.editor = Some(editor);
        self
    }

    /// Unset collaborators fall back to the WebSocket connector, the public
    /// execution service and an in-memory [`TextBuffer`].
    pub fn build(self) -> RoomSession {
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        RoomSession {
            room_id: self.room_id,
            identity: self.identity,
            lifecycle: LifecycleState::Idle,
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(WsConnector::default())),
            channel_config: self
                .channel_config
                .unwrap_or_else(|| ChannelConfig::new("ws://localhost:5001/ws")),
            channel: None,
            events: None,
            state: None,
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(ExecutionGateway::builder(DEFAULT_EXECUTE_URL).build())),
            exec_tx,
            exec_rx,
            exec_task: None,
            running: None,
            next_ticket: 0,
            output: None,
            editor: self.editor.unwrap_or_else(|| Box::new(TextBuffer::new())),
        }
    }
}

// ---------------------------------------------------------------------------
// RoomSession
// ---------------------------------------------------------------------------

pub struct RoomSession {
    room_id: String,
    identity: Option<Identity>,
    lifecycle: LifecycleState,
    connector: Arc<dyn Connector>,
    channel_config: ChannelConfig,
    channel: Option<EventChannel>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    state: Option<RoomSessionState>,
    executor: Arc<dyn Executor>,
    exec_tx: mpsc::UnboundedSender<ExecutionDone>,
    exec_rx: mpsc::UnboundedReceiver<ExecutionDone>,
    exec_task: Option<JoinHandle<()>>,
    running: Option<u64>,
    next_ticket: u64,
    output: Option<OutputPanel>,
    editor: Box<dyn Editor>,
}

enum Next {
    Channel(Option<ChannelEvent>),
    Execution(Option<ExecutionDone>),
}

impl RoomSession {
    pub fn builder(room_id: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(room_id)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn state(&self) -> Option<&RoomSessionState> {
        self.state.as_ref()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.channel
            .as_ref()
            .map(EventChannel::status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn output(&self) -> Option<&OutputPanel> {
        self.output.as_ref()
    }

    pub fn editor(&self) -> &dyn Editor {
        self.editor.as_ref()
    }

    pub fn view(&self) -> Option<RoomView> {
        self.state.as_ref().map(|state| {
            RoomView::build(state, self.status(), self.is_running(), self.output.as_ref())
        })
    }

    // -- Lifecycle ------------------------------------------------------------

    /// `Idle → Joining`. Without an identity the session stays idle.
    pub fn enter(&mut self) -> Result<()> {
        match self.lifecycle {
            LifecycleState::Idle => {}
            LifecycleState::Terminated | LifecycleState::Leaving => {
                return Err(RoomError::Join("this session has already left the room".into()));
            }
            LifecycleState::Joining | LifecycleState::Active => return Ok(()),
        }
        let identity = self.identity.clone().ok_or(RoomError::IdentityMissing)?;

        let state = RoomSessionState::new(self.room_id.clone(), identity.as_str());
        let (channel, events) =
            EventChannel::connect(Arc::clone(&self.connector), self.channel_config.clone());
        self.state = Some(state);
        self.channel = Some(channel);
        self.events = Some(events);
        self.lifecycle = LifecycleState::Joining;
        self.sync_editor();
        info!(room = %self.room_id, username = %identity, "entering room");
        Ok(())
    }

    /// Apply one channel notification.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) -> SessionUpdate {
        if !matches!(self.lifecycle, LifecycleState::Joining | LifecycleState::Active) {
            debug!(lifecycle = %self.lifecycle, "channel event ignored");
            return SessionUpdate::Ignored;
        }
        match event {
            ChannelEvent::Connected => {
                if let Some(state) = &self.state {
                    let join = state.join_announcement();
                    self.emit(&join);
                }
                self.lifecycle = LifecycleState::Active;
                info!(room = %self.room_id, "room session active");
                SessionUpdate::Status(ConnectionStatus::Connected)
            }
            ChannelEvent::Disconnected { reason } => {
                if self.lifecycle == LifecycleState::Active {
                    warn!(
                        room = %self.room_id,
                        reason = reason.as_deref().unwrap_or("closed"),
                        "connection lost, rejoining"
                    );
                    self.lifecycle = LifecycleState::Joining;
                }
                SessionUpdate::Status(ConnectionStatus::Disconnected)
            }
            ChannelEvent::Received(ev) => {
                if let Some(state) = self.state.as_mut() {
                    state.dispatch(ev.clone());
                }
                self.sync_editor();
                SessionUpdate::Room(ev)
            }
        }
    }

    /// Await the next channel or execution event and apply it. `None` once
    /// the session has terminated or its channel is gone.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        if self.lifecycle == LifecycleState::Terminated {
            return None;
        }
        let events = self.events.as_mut()?;
        let exec_rx = &mut self.exec_rx;
        let next = tokio::select! {
            ev = events.recv() => Next::Channel(ev),
            done = exec_rx.recv() => Next::Execution(done),
        };
        match next {
            Next::Channel(Some(ev)) => Some(self.handle_channel_event(ev)),
            Next::Channel(None) => None,
            Next::Execution(Some(done)) => {
                if !self.finish_execution(done) {
                    return Some(SessionUpdate::Ignored);
                }
                Some(
                    self.output
                        .clone()
                        .map(SessionUpdate::Output)
                        .unwrap_or(SessionUpdate::Ignored),
                )
            }
            Next::Execution(None) => None,
        }
    }

    /// `Active → Leaving → Terminated`. The leave announcement goes out
    /// first (when connected); the channel is closed regardless.
    pub async fn leave(&mut self) {
        if self.lifecycle == LifecycleState::Terminated {
            return;
        }
        self.lifecycle = LifecycleState::Leaving;
        if let Some(state) = &self.state {
            let leave = state.leave_announcement();
            self.emit(&leave);
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(task) = self.exec_task.take() {
            task.abort();
        }
        self.events = None;
        self.state = None;
        self.running = None;
        self.lifecycle = LifecycleState::Terminated;
        info!(room = %self.room_id, "left room");
    }

    // -- User actions ---------------------------------------------------------

    /// Local edit. Applied immediately; announced if connected.
    pub fn edit_code(&mut self, code: impl Into<String>) -> bool {
        let Some(state) = self.state.as_mut() else {
            return false;
        };
        let event = state.request_local_code_change(code);
        self.emit(&event)
    }

    /// Pick up changes typed directly into the editor.
    pub fn pull_editor(&mut self) -> bool {
        let text = self.editor.text();
        match &self.state {
            Some(state) if state.code() != text => self.edit_code(text),
            _ => false,
        }
    }

    pub fn select_language(&mut self, language: Language) -> bool {
        let Some(state) = self.state.as_mut() else {
            return false;
        };
        let event = state.request_local_language_change(language);
        self.sync_editor();
        self.emit(&event)
    }

    /// Blank text is dropped. Returns `true` when a message went out.
    pub fn send_chat(&mut self, text: &str) -> bool {
        let event = match self.state.as_ref().and_then(|s| s.compose_chat(text)) {
            Some(ev) => ev,
            None => return false,
        };
        self.emit(&event)
    }

    /// Run the current buffer. At most one run is outstanding per session.
    pub fn run_code(&mut self) -> Result<RunRequest> {
        let state = self.state.as_ref().ok_or(RoomError::NotInRoom)?;
        if self.running.is_some() {
            debug!(room = %self.room_id, "execution already in flight");
            return Ok(RunRequest::AlreadyRunning);
        }
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let code = state.code().to_string();
        let language = state.language();
        let executor = Arc::clone(&self.executor);
        let tx = self.exec_tx.clone();

        self.running = Some(ticket);
        self.output = None;
        self.exec_task = Some(tokio::spawn(async move {
            let outcome = executor.execute(&code, language).await;
            let _ = tx.send(ExecutionDone { ticket, outcome });
        }));
        info!(room = %self.room_id, language = %language, ticket, "execution started");
        Ok(RunRequest::Started { ticket })
    }

    /// Record a finished run. Returns `false` when the result is discarded:
    /// the session has terminated or the ticket is not the outstanding one.
    pub fn finish_execution(&mut self, done: ExecutionDone) -> bool {
        if self.lifecycle == LifecycleState::Terminated || self.running != Some(done.ticket) {
            debug!(ticket = done.ticket, "late execution result discarded");
            return false;
        }
        self.running = None;
        self.exec_task = None;
        let panel = OutputPanel::from_outcome(&done.outcome);
        if panel.failed {
            warn!(room = %self.room_id, error = %panel.error, "execution failed");
        }
        self.output = Some(panel);
        true
    }

    // -- Internals ------------------------------------------------------------

    fn emit(&self, event: &ClientEvent) -> bool {
        match &self.channel {
            Some(channel) => channel.send(event),
            None => false,
        }
    }

    fn sync_editor(&mut self) {
        if let Some(state) = &self.state {
            if self.editor.text() != state.code() {
                self.editor.set_text(state.code());
            }
        }
    }
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.room_id)
            .field("lifecycle", &self.lifecycle)
            .field("status", &self.status())
            .field("running", &self.running)
            .finish()
    }
}
