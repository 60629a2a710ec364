//! Configuration for the room service and the terminal client.
//!
//! Resolution order, later wins:
//! - built-in defaults
//! - the TOML file passed with `--config` (`[server]` and `[client]` tables)
//! - `COMMON_ROOM_*` environment variables

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelConfig, CredentialsMode};
use crate::error::{Result, RoomError};
use crate::execution::DEFAULT_EXECUTE_URL;

pub const ENV_PREFIX: &str = "COMMON_ROOM_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Sent back as `Access-Control-Allow-Origin`.
    pub allowed_origin: String,
    /// Per-room fan-out buffer.
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            allowed_origin: "http://localhost:3000".to_string(),
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL for `/create-room` and `/join-room/<id>`.
    pub server_url: String,
    pub socket_url: String,
    pub execute_url: String,
    /// Origin presented on the socket handshake.
    pub origin: String,
    pub with_credentials: bool,
    pub reconnect_delay_ms: u64,
    pub reconnect_delay_max_ms: u64,
    pub reconnect_jitter: f64,
    pub request_timeout_secs: u64,
    /// Defaults to `~/.common-room/identity.toml`.
    pub identity_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5001".to_string(),
            socket_url: "ws://localhost:5001/ws".to_string(),
            execute_url: DEFAULT_EXECUTE_URL.to_string(),
            origin: "http://localhost:3000".to_string(),
            with_credentials: true,
            reconnect_delay_ms: 1000,
            reconnect_delay_max_ms: 5000,
            reconnect_jitter: 0.0,
            request_timeout_secs: 30,
            identity_file: None,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.identity_file.clone().unwrap_or_else(default_identity_path)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        let credentials = if self.with_credentials {
            CredentialsMode::Include
        } else {
            CredentialsMode::Omit
        };
        let mut cfg = ChannelConfig::new(&self.socket_url)
            .with_credentials(credentials)
            .with_reconnect_delays(
                Duration::from_millis(self.reconnect_delay_ms),
                Duration::from_millis(self.reconnect_delay_max_ms),
            );
        cfg.reconnect_jitter = self.reconnect_jitter;
        cfg
    }
}

fn default_identity_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".common-room")
        .join("identity.toml")
}

impl AppConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = fs::read_to_string(p).map_err(|e| {
                    RoomError::Config(format!("failed to read {}: {}", p.display(), e))
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RoomError::Config(e.to_string()))
    }

    /// Apply `COMMON_ROOM_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("HOST") {
            self.server.host = v;
        }
        if let Some(v) = var("PORT") {
            self.server.port = v
                .parse()
                .map_err(|_| RoomError::Config(format!("{}PORT is not a port: {}", ENV_PREFIX, v)))?;
        }
        if let Some(v) = var("ALLOWED_ORIGIN") {
            self.server.allowed_origin = v;
        }
        if let Some(v) = var("SERVER_URL") {
            self.client.server_url = v;
        }
        if let Some(v) = var("SOCKET_URL") {
            self.client.socket_url = v;
        }
        if let Some(v) = var("EXECUTE_URL") {
            self.client.execute_url = v;
        }
        if let Some(v) = var("IDENTITY_FILE") {
            self.client.identity_file = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
