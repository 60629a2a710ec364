//! Shared coding rooms.
//!
//! Participants share one live code buffer, one selected language, a chat
//! log and a roster. Each client keeps a local mirror ([`state`]) that is
//! fed by an event channel ([`channel`]) and driven by a session controller
//! ([`session`]); [`server`] is the coordination service the clients talk to.

pub mod channel;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod execution;
pub mod identity;
pub mod language;
pub mod lobby;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;
pub mod view;

pub use error::{Result, RoomError};
pub use language::Language;
pub use session::{RoomSession, SessionBuilder};
pub use state::RoomSessionState;
