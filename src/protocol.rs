//! Room coordination wire format.
//!
//! Every event travels as one JSON text frame:
//!
//! ```json
//! {"event": "code_change", "data": {"room": "1a2b3c4d", "code": "...", "username": "alice"}}
//! ```
//!
//! [`ClientEvent`] covers what a participant sends, [`ServerEvent`] what the
//! coordination service fans out.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::language::Language;

/// Room state delivered to a client on every (re)join.
///
/// Each field is optional; only present fields overwrite local state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<String>>,
}

// -- Outbound -----------------------------------------------------------------

/// Events a participant emits toward the coordination service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Join {
        room: String,
        username: String,
    },
    Leave {
        room: String,
        username: String,
    },
    CodeChange {
        room: String,
        code: String,
        username: String,
    },
    LanguageChange {
        room: String,
        language: Language,
        username: String,
    },
    ChatMessage {
        room: String,
        message: String,
        username: String,
    },
    WebrtcOffer {
        room: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        offer: serde_json::Value,
    },
    WebrtcAnswer {
        room: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        answer: serde_json::Value,
    },
    WebrtcIce {
        room: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        candidate: serde_json::Value,
    },
}

impl ClientEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::Leave { .. } => "leave",
            ClientEvent::CodeChange { .. } => "code_change",
            ClientEvent::LanguageChange { .. } => "language_change",
            ClientEvent::ChatMessage { .. } => "chat_message",
            ClientEvent::WebrtcOffer { .. } => "webrtc_offer",
            ClientEvent::WebrtcAnswer { .. } => "webrtc_answer",
            ClientEvent::WebrtcIce { .. } => "webrtc_ice",
        }
    }

    /// Room the event is addressed to.
    pub fn room(&self) -> &str {
        match self {
            ClientEvent::Join { room, .. }
            | ClientEvent::Leave { room, .. }
            | ClientEvent::CodeChange { room, .. }
            | ClientEvent::LanguageChange { room, .. }
            | ClientEvent::ChatMessage { room, .. }
            | ClientEvent::WebrtcOffer { room, .. }
            | ClientEvent::WebrtcAnswer { room, .. }
            | ClientEvent::WebrtcIce { room, .. } => room,
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// -- Inbound ------------------------------------------------------------------

/// Events the coordination service delivers to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    InitialState(Snapshot),
    CodeUpdated {
        code: String,
        username: String,
    },
    LanguageUpdated {
        language: Language,
        username: String,
    },
    NewMessage {
        username: String,
        message: String,
    },
    UserJoined {
        username: String,
    },
    UserLeft {
        username: String,
    },
    WebrtcOffer {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        offer: serde_json::Value,
    },
    WebrtcAnswer {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        answer: serde_json::Value,
    },
    WebrtcIce {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        candidate: serde_json::Value,
    },
}

impl ServerEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::InitialState(_) => "initial_state",
            ServerEvent::CodeUpdated { .. } => "code_updated",
            ServerEvent::LanguageUpdated { .. } => "language_updated",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::WebrtcOffer { .. } => "webrtc_offer",
            ServerEvent::WebrtcAnswer { .. } => "webrtc_answer",
            ServerEvent::WebrtcIce { .. } => "webrtc_ice",
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
