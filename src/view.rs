//! Presentation projection of a room session.
//!
//! A [`RoomView`] is a read-only snapshot rebuilt from [`RoomSessionState`]
//! whenever the front end redraws. It never feeds back into session state.

use serde::Serialize;

use crate::channel::ConnectionStatus;
use crate::execution::OutputPanel;
use crate::language::Language;
use crate::state::{ChatMessage, RoomSessionState, Sender};

/// Marker rendered next to the local participant.
pub const LOCAL_MARKER: &str = "You";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatLine {
    pub sender: String,
    pub body: String,
    pub is_system: bool,
}

impl From<&ChatMessage> for ChatLine {
    fn from(message: &ChatMessage) -> Self {
        ChatLine {
            sender: message.sender.display_name().to_string(),
            body: message.body.clone(),
            is_system: matches!(message.sender, Sender::System),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantRow {
    pub username: String,
    pub is_local: bool,
}

impl ParticipantRow {
    /// `alice (You)` for the local user, the bare name otherwise.
    pub fn label(&self) -> String {
        if self.is_local {
            format!("{} ({})", self.username, LOCAL_MARKER)
        } else {
            self.username.clone()
        }
    }
}

/// Everything a front end needs to draw one frame of the room.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomView {
    pub room_id: String,
    pub local_username: String,
    pub language: Language,
    pub code: String,
    pub connection: String,
    pub connected: bool,
    pub participants_heading: String,
    pub participants: Vec<ParticipantRow>,
    pub chat: Vec<ChatLine>,
    pub running: bool,
    pub output: Option<OutputPanel>,
}

impl RoomView {
    pub fn build(
        state: &RoomSessionState,
        status: ConnectionStatus,
        running: bool,
        output: Option<&OutputPanel>,
    ) -> Self {
        let participants = participant_rows(state);
        RoomView {
            room_id: state.room_id().to_string(),
            local_username: state.local_username().to_string(),
            language: state.language(),
            code: state.code().to_string(),
            connection: connection_label(status).to_string(),
            connected: status == ConnectionStatus::Connected,
            participants_heading: participants_heading(participants.len()),
            participants,
            chat: chat_lines(state.chat()),
            running,
            output: output.cloned(),
        }
    }
}

pub fn chat_lines(messages: &[ChatMessage]) -> Vec<ChatLine> {
    messages.iter().map(ChatLine::from).collect()
}

/// Roster rows in arrival order. The roster is already deduplicated.
pub fn participant_rows(state: &RoomSessionState) -> Vec<ParticipantRow> {
    let local = state.local_username();
    state
        .participants()
        .iter()
        .map(|u| ParticipantRow {
            username: u.to_string(),
            is_local: u == local,
        })
        .collect()
}

pub fn participants_heading(count: usize) -> String {
    format!("Participants ({})", count)
}

pub fn connection_label(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Connected => "Connected",
        ConnectionStatus::Connecting => "Connecting",
        ConnectionStatus::Disconnected => "Disconnected",
    }
}
