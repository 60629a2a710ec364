//! Scripted transport for driving a `RoomSession` without a network.
//!
//! Every `connect` hands the test a [`ConnHandle`]: frames pushed into
//! `to_client` are what the "server" says, `from_client` yields what the
//! session sent. Dropping `to_client` simulates the server closing the socket.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use common_coding_room::channel::{ChannelConfig, Connector, CredentialsMode, Transport};
use common_coding_room::error::{Result, RoomError};
use common_coding_room::execution::{ExecutionResult, Executor};
use common_coding_room::identity::Identity;
use common_coding_room::language::Language;
use common_coding_room::session::{RoomSession, SessionUpdate};

pub struct ConnHandle {
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl ConnHandle {
    pub fn push(&self, frame: &str) {
        self.to_client.send(frame.to_string()).unwrap();
    }

    pub async fn next_sent(&mut self) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("transport dropped");
        serde_json::from_str(&frame).unwrap()
    }
}

struct ScriptedTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|e| RoomError::connection("scripted", e))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct ScriptedConnector {
    handles: mpsc::UnboundedSender<ConnHandle>,
    pub refuse: AtomicBool,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, endpoint: &str, _: CredentialsMode) -> Result<Box<dyn Transport>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RoomError::connection(endpoint, "connection refused"));
        }
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.handles.send(ConnHandle { to_client, from_client });
        Ok(Box::new(ScriptedTransport { inbound, outbound }))
    }
}

pub fn scripted_connector() -> (Arc<ScriptedConnector>, mpsc::UnboundedReceiver<ConnHandle>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ScriptedConnector { handles: tx, refuse: AtomicBool::new(false) }),
        rx,
    )
}

/// Returns the buffer verbatim as program output.
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, code: &str, _: Language) -> Result<ExecutionResult> {
        Ok(ExecutionResult { output: code.to_string(), stderr: None })
    }
}

pub fn fast_channel() -> ChannelConfig {
    ChannelConfig::new("ws://scripted/ws")
        .with_reconnect_delays(Duration::from_millis(5), Duration::from_millis(20))
}

pub fn session_for(
    username: &str,
    connector: Arc<dyn Connector>,
    executor: Arc<dyn Executor>,
) -> RoomSession {
    RoomSession::builder("ab12cd34")
        .identity(Identity::new(username))
        .connector(connector)
        .channel_config(fast_channel())
        .executor(executor)
        .build()
}

pub async fn next_update(session: &mut RoomSession) -> SessionUpdate {
    tokio::time::timeout(Duration::from_secs(2), session.next_update())
        .await
        .expect("timed out waiting for a session update")
        .expect("session ended")
}

pub async fn next_conn(handles: &mut mpsc::UnboundedReceiver<ConnHandle>) -> ConnHandle {
    tokio::time::timeout(Duration::from_secs(2), handles.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}
