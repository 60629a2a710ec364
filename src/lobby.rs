//! Room creation and join, the step before a session opens.
//!
//! Inputs are validated locally first; only valid requests reach the room
//! service. Every failure comes back as [`RoomError::Join`] carrying text
//! fit to show the user as-is.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Result, RoomError};
use crate::identity::Identity;

pub const USERNAME_REQUIRED: &str = "Please enter a username";
pub const USERNAME_AND_ROOM_REQUIRED: &str = "Please enter both username and room code";
pub const CREATE_FAILED: &str = "Failed to create room. Please try again.";
pub const JOIN_FAILED: &str = "Failed to join room. Please check the room code and try again.";

/// Check the create-room form.
pub fn validate_create(username: &str) -> Result<Identity> {
    Identity::new(username).ok_or_else(|| RoomError::Join(USERNAME_REQUIRED.to_string()))
}

/// Check the join-room form. Returns the identity and the trimmed room code.
pub fn validate_join(username: &str, room_code: &str) -> Result<(Identity, String)> {
    let room = room_code.trim();
    match Identity::new(username) {
        Some(identity) if !room.is_empty() => Ok((identity, room.to_string())),
        _ => Err(RoomError::Join(USERNAME_AND_ROOM_REQUIRED.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct CreateRoomResponse {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct JoinRoomResponse {
    #[serde(default)]
    participants: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<String>,
}

/// Successful room entry: where to go and who is already there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub room_id: String,
    pub identity: Identity,
    pub participants: Vec<String>,
}

/// HTTP client for the room service's lobby endpoints.
#[derive(Debug, Clone)]
pub struct LobbyClient {
    base_url: String,
    client: reqwest::Client,
}

impl LobbyClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        LobbyClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /create-room`. Returns the new room id.
    pub async fn create_room(&self) -> Result<String> {
        let url = format!("{}/create-room", self.base_url);
        let body = self.post(&url, None, CREATE_FAILED).await?;
        let created: CreateRoomResponse = serde_json::from_slice(&body).map_err(|e| {
            warn!(error = %e, "create-room response malformed");
            RoomError::Join(CREATE_FAILED.to_string())
        })?;
        info!(room = %created.room_id, "room created");
        Ok(created.room_id)
    }

    /// `POST /join-room/<room>`. Returns the participant list.
    pub async fn join_room(&self, room_id: &str, identity: &Identity) -> Result<Vec<String>> {
        self.join_with_fallback(room_id, identity, JOIN_FAILED).await
    }

    /// The "create" flow: validate, create, then join the new room.
    pub async fn create_and_join(&self, username: &str) -> Result<Admission> {
        let identity = validate_create(username)?;
        let room_id = self.create_room().await?;
        let participants = self
            .join_with_fallback(&room_id, &identity, CREATE_FAILED)
            .await?;
        Ok(Admission {
            room_id,
            identity,
            participants,
        })
    }

    /// The "join" flow: validate, then join an existing room.
    pub async fn join_existing(&self, username: &str, room_code: &str) -> Result<Admission> {
        let (identity, room_id) = validate_join(username, room_code)?;
        let participants = self.join_room(&room_id, &identity).await?;
        Ok(Admission {
            room_id,
            identity,
            participants,
        })
    }

    async fn join_with_fallback(
        &self,
        room_id: &str,
        identity: &Identity,
        fallback: &str,
    ) -> Result<Vec<String>> {
        let url = format!("{}/join-room/{}", self.base_url, room_id);
        let payload = json!({ "username": identity.as_str() });
        let body = self.post(&url, Some(&payload), fallback).await?;
        let joined: JoinRoomResponse = serde_json::from_slice(&body).map_err(|e| {
            warn!(error = %e, "join-room response malformed");
            RoomError::Join(fallback.to_string())
        })?;
        info!(room = %room_id, username = %identity, "joined room");
        Ok(joined.participants)
    }

    async fn post(
        &self,
        url: &str,
        payload: Option<&serde_json::Value>,
        fallback: &str,
    ) -> Result<Vec<u8>> {
        debug!(url = %url, "lobby request");
        let mut req = self.client.post(url);
        if let Some(p) = payload {
            req = req.json(p);
        }
        let resp = req.send().await.map_err(|e| {
            warn!(error = %e, url = %url, "lobby request failed");
            RoomError::Join(fallback.to_string())
        })?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| {
            warn!(error = %e, url = %url, "lobby response unreadable");
            RoomError::Join(fallback.to_string())
        })?;
        if !status.is_success() {
            let message = rejection_message(&body).unwrap_or_else(|| fallback.to_string());
            warn!(status = status.as_u16(), url = %url, message = %message, "lobby request rejected");
            return Err(RoomError::Join(message));
        }
        Ok(body.to_vec())
    }
}

/// The service's `{"error": "..."}` text, if any.
pub fn rejection_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .filter(|m| !m.trim().is_empty())
}
