//! Local mirror of shared room state.
//!
//! [`RoomSessionState`] is the single authoritative copy of a room's code,
//! language, roster and chat log on one client. Inbound events are applied
//! through [`RoomSessionState::dispatch`]; local user actions return the
//! [`ClientEvent`] the caller must emit.
//!
//! ## Rules
//! - Echo suppression: remote code/language updates labelled with the local
//!   username are ignored.
//! - Last-write-wins: the most recently applied update replaces the buffer,
//!   with no merge across senders.
//! - Template substitution: selecting a language, locally or remotely, always
//!   reseeds the buffer with that language's starter template.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::language::Language;
use crate::protocol::{ClientEvent, ServerEvent, Snapshot};

/// Display name used for synthesized chat entries.
pub const SYSTEM_SENDER: &str = "System";

/// Author of a chat entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    User(String),
    System,
}

impl Sender {
    pub fn display_name(&self) -> &str {
        match self {
            Sender::User(name) => name,
            Sender::System => SYSTEM_SENDER,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Sender::System)
    }
}

/// One chat entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    pub body: String,
}

impl ChatMessage {
    pub fn user(username: impl Into<String>, body: impl Into<String>) -> Self {
        ChatMessage {
            sender: Sender::User(username.into()),
            body: body.into(),
        }
    }

    pub fn system(body: impl Into<String>) -> Self {
        ChatMessage {
            sender: Sender::System,
            body: body.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

/// Username set that remembers arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participants {
    order: Vec<String>,
}

impl Participants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `username` at the end. Returns `false` if it was already present.
    pub fn insert(&mut self, username: &str) -> bool {
        if self.contains(username) {
            return false;
        }
        self.order.push(username.to_string());
        true
    }

    /// Returns `false` if `username` was not present.
    pub fn remove(&mut self, username: &str) -> bool {
        let before = self.order.len();
        self.order.retain(|u| u != username);
        self.order.len() != before
    }

    /// Replace the whole roster, keeping the first occurrence of duplicates.
    pub fn replace_all<I, S>(&mut self, usernames: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.order.clear();
        for u in usernames {
            self.insert(u.as_ref());
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.order.iter().any(|u| u == username)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RoomState
// ---------------------------------------------------------------------------

/// The shared part of a room: buffer, language and roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub code: String,
    pub language: Language,
    pub participants: Participants,
}

impl Default for RoomState {
    /// Placeholder state used until the first snapshot arrives.
    fn default() -> Self {
        let language = Language::default();
        RoomState {
            code: language.template().to_string(),
            language,
            participants: Participants::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// RoomSessionState
// ---------------------------------------------------------------------------

/// Per-client room mirror plus the session-scoped chat log.
#[derive(Debug, Clone)]
pub struct RoomSessionState {
    room_id: String,
    local_username: String,
    room: RoomState,
    chat: Vec<ChatMessage>,
}

impl RoomSessionState {
    pub fn new(room_id: impl Into<String>, local_username: impl Into<String>) -> Self {
        RoomSessionState {
            room_id: room_id.into(),
            local_username: local_username.into(),
            room: RoomState::default(),
            chat: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_username(&self) -> &str {
        &self.local_username
    }

    pub fn room(&self) -> &RoomState {
        &self.room
    }

    pub fn code(&self) -> &str {
        &self.room.code
    }

    pub fn language(&self) -> Language {
        self.room.language
    }

    pub fn participants(&self) -> &Participants {
        &self.room.participants
    }

    pub fn chat(&self) -> &[ChatMessage] {
        &self.chat
    }

    fn is_self(&self, sender: &str) -> bool {
        sender == self.local_username
    }

    // -- Inbound --------------------------------------------------------------

    /// Route one inbound event to the matching operation.
    pub fn dispatch(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::InitialState(snapshot) => self.apply_initial_state(&snapshot),
            ServerEvent::CodeUpdated { code, username } => {
                self.apply_remote_code_update(&username, code);
            }
            ServerEvent::LanguageUpdated { language, username } => {
                self.apply_remote_language_update(&username, language);
            }
            ServerEvent::NewMessage { username, message } => {
                self.apply_chat_message(ChatMessage::user(username, message));
            }
            ServerEvent::UserJoined { username } => {
                self.apply_participant_joined(&username);
            }
            ServerEvent::UserLeft { username } => {
                self.apply_participant_left(&username);
            }
            ServerEvent::WebrtcOffer { .. }
            | ServerEvent::WebrtcAnswer { .. }
            | ServerEvent::WebrtcIce { .. } => {
                debug!(event = event.name(), "signaling relay event ignored by room state");
            }
        }
    }

    /// Overwrite every field present in `snapshot`.
    ///
    /// An empty `code` counts as absent. A language without code reseeds the
    /// buffer with that language's template, so applying the same snapshot
    /// twice lands on the same state.
    pub fn apply_initial_state(&mut self, snapshot: &Snapshot) {
        if let Some(language) = snapshot.language {
            self.room.language = language;
        }
        match snapshot.code.as_deref() {
            Some(code) if !code.is_empty() => self.room.code = code.to_string(),
            _ => {
                if let Some(language) = snapshot.language {
                    self.room.code = language.template().to_string();
                }
            }
        }
        if let Some(participants) = &snapshot.participants {
            self.room.participants.replace_all(participants);
        }
        debug!(
            room = %self.room_id,
            language = %self.room.language,
            participants = self.room.participants.len(),
            "initial state applied"
        );
    }

    /// Replace the buffer with a peer's code. Returns `false` when the update
    /// is the local user's own echo.
    pub fn apply_remote_code_update(&mut self, sender: &str, code: String) -> bool {
        if self.is_self(sender) {
            debug!(room = %self.room_id, "suppressed echo of own code change");
            return false;
        }
        self.room.code = code;
        true
    }

    /// Switch to a peer's language and reseed its template. Returns `false`
    /// for the local user's own echo.
    pub fn apply_remote_language_update(&mut self, sender: &str, language: Language) -> bool {
        if self.is_self(sender) {
            debug!(room = %self.room_id, "suppressed echo of own language change");
            return false;
        }
        self.select_language(language);
        true
    }

    /// Returns `true` if `username` was newly added.
    pub fn apply_participant_joined(&mut self, username: &str) -> bool {
        let added = self.room.participants.insert(username);
        if added {
            self.chat
                .push(ChatMessage::system(format!("{} joined the room", username)));
        }
        added
    }

    /// Returns `true` if `username` was present and removed.
    pub fn apply_participant_left(&mut self, username: &str) -> bool {
        let removed = self.room.participants.remove(username);
        if removed {
            self.chat
                .push(ChatMessage::system(format!("{} left the room", username)));
        }
        removed
    }

    pub fn apply_chat_message(&mut self, message: ChatMessage) {
        self.chat.push(message);
    }

    // -- Outbound -------------------------------------------------------------

    /// Apply a local edit immediately and return the event announcing it.
    pub fn request_local_code_change(&mut self, code: impl Into<String>) -> ClientEvent {
        self.room.code = code.into();
        ClientEvent::CodeChange {
            room: self.room_id.clone(),
            code: self.room.code.clone(),
            username: self.local_username.clone(),
        }
    }

    /// Switch language locally, discarding the current buffer in favour of
    /// the language template, and return the event announcing it.
    pub fn request_local_language_change(&mut self, language: Language) -> ClientEvent {
        self.select_language(language);
        ClientEvent::LanguageChange {
            room: self.room_id.clone(),
            language,
            username: self.local_username.clone(),
        }
    }

    /// Build a chat event from user input. Blank input yields nothing.
    pub fn compose_chat(&self, text: &str) -> Option<ClientEvent> {
        let message = text.trim();
        if message.is_empty() {
            return None;
        }
        Some(ClientEvent::ChatMessage {
            room: self.room_id.clone(),
            message: message.to_string(),
            username: self.local_username.clone(),
        })
    }

    pub fn join_announcement(&self) -> ClientEvent {
        ClientEvent::Join {
            room: self.room_id.clone(),
            username: self.local_username.clone(),
        }
    }

    pub fn leave_announcement(&self) -> ClientEvent {
        ClientEvent::Leave {
            room: self.room_id.clone(),
            username: self.local_username.clone(),
        }
    }

    fn select_language(&mut self, language: Language) {
        self.room.language = language;
        self.room.code = language.template().to_string();
    }
}
