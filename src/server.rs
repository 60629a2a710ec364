//! Room coordination service: HTTP lobby endpoints plus WebSocket fan-out.
//!
//! ## Design
//! - RoomStore: `Arc<Mutex<HashMap<String, Room>>>` shared across connections,
//!   held only for short critical sections
//! - Each Room owns a `tokio::sync::broadcast` channel; a socket subscribes
//!   when it sends `join` and drops the subscription on `leave`
//! - Every fan-out carries the originating connection id so "everyone but the
//!   sender" is decided by each receiver
//! - Rooms live in memory only and are never reaped
//!
//! ## HTTP
//! | Method | Path | Result |
//! |---|---|---|
//! | GET | `/` | banner |
//! | POST | `/create-room` | `{"room_id"}` |
//! | POST | `/join-room/<id>` | `{"status","participants"}`, 404 / 400 `{"error"}` |
//! | OPTIONS | any | 200 |
//!
//! Any request carrying `Upgrade: websocket` is handed to [`handle_ws`].

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, RoomError};
use crate::language::Language;
use crate::protocol::{ClientEvent, ServerEvent, Snapshot};

pub const BANNER: &str = "Common Coding Room Backend";
pub const ROOM_NOT_FOUND: &str = "Room not found";
pub const USERNAME_REQUIRED: &str = "Username is required";

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Shared room store: room id → Room.
pub type RoomStore = Arc<Mutex<HashMap<String, Room>>>;

/// One event on a room's broadcast channel.
#[derive(Debug, Clone)]
pub struct Fanout {
    pub origin: u64,
    pub include_origin: bool,
    pub event: ServerEvent,
}

impl Fanout {
    pub fn all(origin: u64, event: ServerEvent) -> Self {
        Fanout { origin, include_origin: true, event }
    }

    pub fn except(origin: u64, event: ServerEvent) -> Self {
        Fanout { origin, include_origin: false, event }
    }

    pub fn delivers_to(&self, conn_id: u64) -> bool {
        self.include_origin || self.origin != conn_id
    }
}

pub struct Room {
    pub id: String,
    pub participants: Vec<String>,
    pub code: String,
    pub language: Language,
    pub created_at_ms: u64,
    broadcast_tx: broadcast::Sender<Fanout>,
}

impl Room {
    fn new(id: String, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Room {
            id,
            participants: Vec::new(),
            code: String::new(),
            language: Language::default(),
            created_at_ms: now_ms(),
            broadcast_tx: tx,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            code: Some(self.code.clone()),
            language: Some(self.language),
            participants: Some(self.participants.clone()),
        }
    }

    fn publish(&self, fanout: Fanout) {
        // No subscribers is not an error.
        let _ = self.broadcast_tx.send(fanout);
    }
}

// ---------------------------------------------------------------------------
// Room operations
// ---------------------------------------------------------------------------

pub fn new_room_store() -> RoomStore {
    Arc::new(Mutex::new(HashMap::new()))
}

/// First 8 characters of a v4 UUID.
pub fn generate_room_id() -> String {
    uuid::Uuid::new_v4().to_string().chars().take(8).collect()
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Create a new empty room and return its id.
pub fn create_room(store: &RoomStore, capacity: usize) -> Result<String> {
    let mut guard = store
        .lock()
        .map_err(|_| RoomError::Config("internal: room store lock poisoned".into()))?;
    let mut id = generate_room_id();
    while guard.contains_key(&id) {
        id = generate_room_id();
    }
    guard.insert(id.clone(), Room::new(id.clone(), capacity));
    debug!(room = %id, "created room");
    Ok(id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    RoomNotFound,
    UsernameRequired,
}

impl RegisterError {
    pub fn status(&self) -> u16 {
        match self {
            RegisterError::RoomNotFound => 404,
            RegisterError::UsernameRequired => 400,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RegisterError::RoomNotFound => ROOM_NOT_FOUND,
            RegisterError::UsernameRequired => USERNAME_REQUIRED,
        }
    }
}

/// The HTTP join: add `username` if absent and return the roster.
pub fn register_participant(
    store: &RoomStore,
    room_id: &str,
    username: Option<&str>,
) -> std::result::Result<Vec<String>, RegisterError> {
    let mut guard = store.lock().map_err(|_| RegisterError::RoomNotFound)?;
    let room = guard.get_mut(room_id).ok_or(RegisterError::RoomNotFound)?;
    let username = username
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or(RegisterError::UsernameRequired)?;
    if !room.participants.iter().any(|p| p == username) {
        room.participants.push(username.to_string());
    }
    debug!(room = %room_id, username, "participant registered");
    Ok(room.participants.clone())
}

pub fn participants(store: &RoomStore, room_id: &str) -> Option<Vec<String>> {
    let guard = store.lock().ok()?;
    guard.get(room_id).map(|r| r.participants.clone())
}

/// A socket's current room subscription.
pub struct Membership {
    pub room: String,
    pub username: String,
    rx: broadcast::Receiver<Fanout>,
}

impl Membership {
    pub async fn recv(&mut self) -> std::result::Result<Fanout, broadcast::error::RecvError> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Fanout, broadcast::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Apply one socket event from connection `conn_id`.
///
/// Fan-out happens on the room channel; the returned events go to the
/// sending socket only.
pub fn apply_client_event(
    store: &RoomStore,
    conn_id: u64,
    membership: &mut Option<Membership>,
    event: ClientEvent,
) -> Vec<ServerEvent> {
    let Ok(mut guard) = store.lock() else {
        error!("room store lock poisoned");
        return Vec::new();
    };

    match event {
        ClientEvent::Join { room, username } => {
            let Some(r) = guard.get_mut(&room) else {
                warn!(room = %room, "socket join for unknown room");
                return Vec::new();
            };
            let username = username.trim().to_string();
            if username.is_empty() {
                warn!(room = %room, "socket join without a username");
                return Vec::new();
            }
            if !r.participants.iter().any(|p| p == &username) {
                r.participants.push(username.clone());
            }
            let rx = r.broadcast_tx.subscribe();
            let snapshot = r.snapshot();
            r.publish(Fanout::except(conn_id, ServerEvent::UserJoined { username: username.clone() }));
            info!(room = %room, username = %username, "socket joined room");
            *membership = Some(Membership { room, username, rx });
            vec![ServerEvent::InitialState(snapshot)]
        }
        ClientEvent::Leave { room, username } => {
            if let Some(r) = guard.get_mut(&room) {
                r.participants.retain(|p| p != &username);
                r.publish(Fanout::except(conn_id, ServerEvent::UserLeft { username: username.clone() }));
            }
            if membership.as_ref().is_some_and(|m| m.room == room) {
                *membership = None;
            }
            info!(room = %room, username = %username, "socket left room");
            Vec::new()
        }
        ClientEvent::CodeChange { room, code, username } => {
            match guard.get_mut(&room) {
                Some(r) => {
                    r.code = code.clone();
                    debug!(room = %room, username = %username, "code updated");
                    r.publish(Fanout::except(conn_id, ServerEvent::CodeUpdated { code, username }));
                }
                None => warn!(room = %room, "code_change for unknown room"),
            }
            Vec::new()
        }
        ClientEvent::LanguageChange { room, language, username } => {
            match guard.get_mut(&room) {
                Some(r) => {
                    r.language = language;
                    // Clients reseed from the template; an empty buffer makes
                    // later snapshots do the same.
                    r.code.clear();
                    debug!(room = %room, language = %language, username = %username, "language updated");
                    r.publish(Fanout::except(conn_id, ServerEvent::LanguageUpdated { language, username }));
                }
                None => warn!(room = %room, "language_change for unknown room"),
            }
            Vec::new()
        }
        ClientEvent::ChatMessage { room, message, username } => {
            debug!(room = %room, username = %username, "chat message");
            if let Some(r) = guard.get(&room) {
                r.publish(Fanout::all(conn_id, ServerEvent::NewMessage { username, message }));
            }
            Vec::new()
        }
        ClientEvent::WebrtcOffer { room, from, to, offer } => {
            relay(&guard, &room, conn_id, to.is_some(), ServerEvent::WebrtcOffer { from, to, offer });
            Vec::new()
        }
        ClientEvent::WebrtcAnswer { room, from, to, answer } => {
            relay(&guard, &room, conn_id, to.is_some(), ServerEvent::WebrtcAnswer { from, to, answer });
            Vec::new()
        }
        ClientEvent::WebrtcIce { room, from, to, candidate } => {
            relay(&guard, &room, conn_id, to.is_some(), ServerEvent::WebrtcIce { from, to, candidate });
            Vec::new()
        }
    }
}

/// Targeted relays go to the whole room (receivers filter on `to`);
/// untargeted ones skip the sender.
fn relay(rooms: &HashMap<String, Room>, room: &str, conn_id: u64, targeted: bool, event: ServerEvent) {
    debug!(room = %room, event = event.name(), targeted, "signaling relay");
    if let Some(r) = rooms.get(room) {
        let fanout = if targeted {
            Fanout::all(conn_id, event)
        } else {
            Fanout::except(conn_id, event)
        };
        r.publish(fanout);
    }
}

// ---------------------------------------------------------------------------
// WebSocket handler
// ---------------------------------------------------------------------------

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

async fn next_fanout(
    membership: &mut Option<Membership>,
) -> std::result::Result<Fanout, broadcast::error::RecvError> {
    match membership.as_mut() {
        Some(m) => m.recv().await,
        None => std::future::pending().await,
    }
}

/// Serve one upgraded socket until it closes. A socket that drops without
/// `leave` keeps its roster entry.
pub async fn handle_ws(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    store: RoomStore,
    conn_id: u64,
) {
    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let mut membership: Option<Membership> = None;
    debug!(conn = conn_id, "socket connected");

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let event = match ClientEvent::from_frame(&text) {
                            Ok(ev) => ev,
                            Err(e) => {
                                debug!(conn = conn_id, error = %e, "unparseable socket frame");
                                continue;
                            }
                        };
                        let direct = apply_client_event(&store, conn_id, &mut membership, event);
                        for ev in direct {
                            match ev.to_frame() {
                                Ok(frame) => {
                                    if ws_sink.send(WsMessage::Text(frame)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => error!(error = %e, "failed to encode event"),
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {} // binary / ping / pong
                }
            }

            bcast = next_fanout(&mut membership) => {
                match bcast {
                    Ok(fanout) => {
                        if !fanout.delivers_to(conn_id) {
                            continue;
                        }
                        if let Ok(frame) = fanout.event.to_frame() {
                            if ws_sink.send(WsMessage::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(conn = conn_id, skipped = n, "socket fell behind room fan-out");
                    }
                    Err(broadcast::error::RecvError::Closed) => membership = None,
                }
            }
        }
    }

    debug!(
        conn = conn_id,
        room = membership.as_ref().map(|m| m.room.as_str()).unwrap_or("-"),
        "socket disconnected"
    );
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    fn json(status: u16, value: serde_json::Value) -> Self {
        HttpResponse {
            status,
            content_type: "application/json",
            body: value.to_string(),
        }
    }

    fn text(status: u16, body: &str) -> Self {
        HttpResponse {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.to_string(),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            _ => "Internal Server Error",
        }
    }

    pub fn to_http(&self, allowed_origin: &str) -> String {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: {}\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len(),
            allowed_origin,
            self.body,
        )
    }
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    username: Option<String>,
}

/// Dispatch one HTTP request against the store.
pub fn route(store: &RoomStore, capacity: usize, request: &HttpRequest) -> HttpResponse {
    let path = request.path.split('?').next().unwrap_or("/");
    if request.method == "OPTIONS" {
        return HttpResponse::text(200, "");
    }
    match (request.method.as_str(), path) {
        ("GET", "/") => HttpResponse::text(200, BANNER),
        ("POST", "/create-room") => match create_room(store, capacity) {
            Ok(id) => HttpResponse::json(200, serde_json::json!({ "room_id": id })),
            Err(e) => {
                error!(error = %e, "create-room failed");
                HttpResponse::json(500, serde_json::json!({ "error": e.to_string() }))
            }
        },
        ("POST", p) if p.starts_with("/join-room/") => {
            let room_id = p.trim_start_matches("/join-room/");
            let username = serde_json::from_slice::<JoinRequest>(&request.body)
                .ok()
                .and_then(|r| r.username);
            match register_participant(store, room_id, username.as_deref()) {
                Ok(list) => HttpResponse::json(
                    200,
                    serde_json::json!({ "status": "success", "participants": list }),
                ),
                Err(e) => {
                    warn!(room = %room_id, reason = e.message(), "join-room rejected");
                    HttpResponse::json(e.status(), serde_json::json!({ "error": e.message() }))
                }
            }
        }
        _ => HttpResponse::text(404, "Not Found"),
    }
}

async fn read_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = req.method.unwrap_or("GET").to_string();
                let path = req.path.unwrap_or("/").to_string();
                let content_length = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0)
                    .min(MAX_BODY_BYTES);
                let mut body = buf[head_len..].to_vec();
                while body.len() < content_length {
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&chunk[..n]);
                }
                body.truncate(content_length);
                return Ok(Some(HttpRequest { method, path, body }));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Ok(None);
                }
            }
            Err(e) => {
                return Err(RoomError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e,
                )));
            }
        }
    }
}

fn is_websocket_upgrade(head: &[u8]) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(head).is_err() {
        return false;
    }
    req.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("upgrade")
            && String::from_utf8_lossy(h.value)
                .to_ascii_lowercase()
                .contains("websocket")
    })
}

fn head_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Peek until the request head is buffered, without consuming it.
async fn peek_head(stream: &TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let mut seen = 0;
    let deadline = tokio::time::Instant::now() + HEAD_TIMEOUT;
    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => {
                buf.truncate(seen);
                return buf;
            }
        };
        if n == 0 || n == buf.len() || head_complete(&buf[..n]) || tokio::time::Instant::now() >= deadline {
            buf.truncate(n);
            return buf;
        }
        if n == seen {
            // peek returns buffered bytes immediately; wait for the next segment.
            tokio::time::sleep(PEEK_RETRY).await;
        }
        seen = n;
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    store: RoomStore,
    config: Arc<ServerConfig>,
) -> Result<()> {
    let head = peek_head(&stream).await;

    if is_websocket_upgrade(&head) {
        match tokio_tungstenite::accept_async(stream).await {
            Ok(ws_stream) => handle_ws(ws_stream, store, next_conn_id()).await,
            Err(e) => warn!(error = %e, "websocket handshake failed"),
        }
        return Ok(());
    }

    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };
    let response = route(&store, config.broadcast_capacity, &request);
    debug!(method = %request.method, path = %request.path, status = response.status, "http request");
    stream
        .write_all(response.to_http(&config.allowed_origin).as_bytes())
        .await?;
    Ok(())
}

/// A bound, not yet running, coordination service.
pub struct RoomServer {
    listener: TcpListener,
    store: RoomStore,
    config: Arc<ServerConfig>,
}

impl RoomServer {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        Ok(RoomServer {
            listener,
            store: new_room_store(),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn store(&self) -> RoomStore {
        Arc::clone(&self.store)
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(addr = %self.local_addr()?, "room service listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("room service shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let store = Arc::clone(&self.store);
                    let config = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, store, config).await {
                            debug!(peer = %peer, error = %e, "connection error");
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(path: &str, body: &str) -> HttpRequest {
        HttpRequest {
            method: "POST".into(),
            path: path.into(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn json_body(resp: &HttpResponse) -> serde_json::Value {
        serde_json::from_str(&resp.body).unwrap()
    }

    fn join(store: &RoomStore, conn: u64, room: &str, user: &str) -> (Option<Membership>, Vec<ServerEvent>) {
        let mut m = None;
        let direct = apply_client_event(
            store,
            conn,
            &mut m,
            ClientEvent::Join { room: room.into(), username: user.into() },
        );
        (m, direct)
    }

    fn drain(m: &mut Option<Membership>, conn: u64) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        if let Some(m) = m.as_mut() {
            while let Ok(f) = m.try_recv() {
                if f.delivers_to(conn) {
                    out.push(f.event);
                }
            }
        }
        out
    }

    // -- Room operations -----------------------------------------------------

    #[test]
    fn test_generate_room_id_is_8_hex_chars() {
        let id = generate_room_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_create_room_starts_empty_python() {
        let store = new_room_store();
        let id = create_room(&store, 16).unwrap();
        let guard = store.lock().unwrap();
        let room = guard.get(&id).unwrap();
        assert!(room.participants.is_empty());
        assert_eq!(room.code, "");
        assert_eq!(room.language, Language::Python);
    }

    #[test]
    fn test_register_participant_rules() {
        let store = new_room_store();
        let id = create_room(&store, 16).unwrap();
        assert_eq!(register_participant(&store, "nope", Some("a")), Err(RegisterError::RoomNotFound));
        assert_eq!(register_participant(&store, &id, None), Err(RegisterError::UsernameRequired));
        assert_eq!(register_participant(&store, &id, Some("")), Err(RegisterError::UsernameRequired));
        assert_eq!(register_participant(&store, &id, Some("alice")).unwrap(), vec!["alice"]);
        assert_eq!(register_participant(&store, &id, Some("alice")).unwrap(), vec!["alice"]);
    }

    // -- HTTP routing --------------------------------------------------------

    #[test]
    fn test_route_banner_and_404() {
        let store = new_room_store();
        let get = HttpRequest { method: "GET".into(), path: "/".into(), body: vec![] };
        assert_eq!(route(&store, 16, &get).body, BANNER);
        let other = HttpRequest { method: "GET".into(), path: "/nope".into(), body: vec![] };
        assert_eq!(route(&store, 16, &other).status, 404);
    }

    #[test]
    fn test_route_options_is_ok() {
        let store = new_room_store();
        let req = HttpRequest { method: "OPTIONS".into(), path: "/create-room".into(), body: vec![] };
        assert_eq!(route(&store, 16, &req).status, 200);
    }

    #[test]
    fn test_route_create_then_join() {
        let store = new_room_store();
        let created = route(&store, 16, &post("/create-room", ""));
        let id = json_body(&created)["room_id"].as_str().unwrap().to_string();

        let joined = route(&store, 16, &post(&format!("/join-room/{}", id), r#"{"username":"bob"}"#));
        assert_eq!(joined.status, 200);
        let v = json_body(&joined);
        assert_eq!(v["status"], "success");
        assert_eq!(v["participants"], serde_json::json!(["bob"]));
    }

    #[test]
    fn test_route_join_errors() {
        let store = new_room_store();
        let missing = route(&store, 16, &post("/join-room/zzzz", r#"{"username":"bob"}"#));
        assert_eq!(missing.status, 404);
        assert_eq!(json_body(&missing)["error"], "Room not found");

        let id = create_room(&store, 16).unwrap();
        let no_user = route(&store, 16, &post(&format!("/join-room/{}", id), "{}"));
        assert_eq!(no_user.status, 400);
        assert_eq!(json_body(&no_user)["error"], "Username is required");
    }

    #[test]
    fn test_response_carries_cors_origin() {
        let http = HttpResponse::text(200, "x").to_http("http://localhost:3000");
        assert!(http.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(http.contains("Access-Control-Allow-Origin: http://localhost:3000\r\n"));
        assert!(http.ends_with("\r\n\r\nx"));
    }

    #[test]
    fn test_websocket_upgrade_detection_is_case_insensitive() {
        assert!(is_websocket_upgrade(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n"));
        assert!(is_websocket_upgrade(b"GET / HTTP/1.1\r\nupgrade: WebSocket\r\n\r\n"));
        assert!(!is_websocket_upgrade(b"POST /create-room HTTP/1.1\r\nHost: x\r\n\r\n"));
    }

    #[test]
    fn test_websocket_upgrade_found_past_a_long_head() {
        let padding = "x".repeat(2000);
        let head = format!("GET /ws HTTP/1.1\r\nX-Pad: {}\r\nUpgrade: websocket\r\n\r\n", padding);
        assert!(head.len() > 1024);
        assert!(is_websocket_upgrade(head.as_bytes()));
        assert!(head_complete(head.as_bytes()));
        assert!(!head_complete(b"GET /ws HTTP/1.1\r\nUpgrade: web"));
    }

    #[test]
    fn test_socket_join_rejects_blank_username() {
        let store = new_room_store();
        let id = create_room(&store, 16).unwrap();
        let (m, direct) = join(&store, 1, &id, "   ");
        assert!(m.is_none());
        assert!(direct.is_empty());
        assert!(participants(&store, &id).unwrap().is_empty());

        let (m, _) = join(&store, 2, &id, " alice ");
        assert_eq!(m.unwrap().username, "alice");
        assert_eq!(participants(&store, &id).unwrap(), vec!["alice"]);
    }

    #[test]
    fn test_language_change_resets_stored_buffer() {
        let store = new_room_store();
        let id = create_room(&store, 16).unwrap();
        let (mut alice, _) = join(&store, 1, &id, "alice");
        apply_client_event(
            &store,
            1,
            &mut alice,
            ClientEvent::CodeChange { room: id.clone(), code: "print('hi')".into(), username: "alice".into() },
        );
        apply_client_event(
            &store,
            1,
            &mut alice,
            ClientEvent::LanguageChange { room: id.clone(), language: Language::Rust, username: "alice".into() },
        );
        let guard = store.lock().unwrap();
        let room = guard.get(&id).unwrap();
        assert_eq!(room.code, "");
        assert_eq!(room.language, Language::Rust);
    }

    // -- Socket events -------------------------------------------------------

    #[test]
    fn test_join_unknown_room_is_ignored() {
        let store = new_room_store();
        let (m, direct) = join(&store, 1, "ghost", "alice");
        assert!(m.is_none());
        assert!(direct.is_empty());
    }

    #[test]
    fn test_join_sends_snapshot_to_joiner_and_notifies_others() {
        let store = new_room_store();
        let id = create_room(&store, 16).unwrap();
        let (mut alice, _) = join(&store, 1, &id, "alice");
        let (mut bob, direct) = join(&store, 2, &id, "bob");

        match &direct[..] {
            [ServerEvent::InitialState(s)] => {
                assert_eq!(s.participants.as_deref(), Some(&["alice".to_string(), "bob".to_string()][..]));
                assert_eq!(s.language, Some(Language::Python));
            }
            other => panic!("unexpected direct events: {:?}", other),
        }
        assert_eq!(drain(&mut alice, 1), vec![ServerEvent::UserJoined { username: "bob".into() }]);
        assert!(drain(&mut bob, 2).is_empty(), "joiner does not see its own user_joined");
    }

    #[test]
    fn test_code_change_stored_and_excludes_sender() {
        let store = new_room_store();
        let id = create_room(&store, 16).unwrap();
        let (mut alice, _) = join(&store, 1, &id, "alice");
        let (mut bob, _) = join(&store, 2, &id, "bob");
        drain(&mut alice, 1);

        apply_client_event(
            &store,
            1,
            &mut alice,
            ClientEvent::CodeChange { room: id.clone(), code: "x = 1".into(), username: "alice".into() },
        );
        assert!(drain(&mut alice, 1).is_empty());
        assert_eq!(
            drain(&mut bob, 2),
            vec![ServerEvent::CodeUpdated { code: "x = 1".into(), username: "alice".into() }]
        );
        assert_eq!(store.lock().unwrap().get(&id).unwrap().code, "x = 1");
    }

    #[test]
    fn test_chat_reaches_sender_too() {
        let store = new_room_store();
        let id = create_room(&store, 16).unwrap();
        let (mut alice, _) = join(&store, 1, &id, "alice");
        apply_client_event(
            &store,
            1,
            &mut alice,
            ClientEvent::ChatMessage { room: id.clone(), message: "hi".into(), username: "alice".into() },
        );
        assert_eq!(
            drain(&mut alice, 1),
            vec![ServerEvent::NewMessage { username: "alice".into(), message: "hi".into() }]
        );
    }

    #[test]
    fn test_leave_removes_and_unsubscribes() {
        let store = new_room_store();
        let id = create_room(&store, 16).unwrap();
        let (mut alice, _) = join(&store, 1, &id, "alice");
        let (mut bob, _) = join(&store, 2, &id, "bob");
        drain(&mut alice, 1);

        apply_client_event(
            &store,
            2,
            &mut bob,
            ClientEvent::Leave { room: id.clone(), username: "bob".into() },
        );
        assert!(bob.is_none());
        assert_eq!(participants(&store, &id).unwrap(), vec!["alice"]);
        assert_eq!(drain(&mut alice, 1), vec![ServerEvent::UserLeft { username: "bob".into() }]);
    }

    #[test]
    fn test_targeted_relay_includes_sender_untargeted_does_not() {
        let store = new_room_store();
        let id = create_room(&store, 16).unwrap();
        let (mut alice, _) = join(&store, 1, &id, "alice");
        apply_client_event(
            &store,
            1,
            &mut alice,
            ClientEvent::WebrtcIce {
                room: id.clone(),
                from: "alice".into(),
                to: None,
                candidate: serde_json::json!({}),
            },
        );
        assert!(drain(&mut alice, 1).is_empty());
        apply_client_event(
            &store,
            1,
            &mut alice,
            ClientEvent::WebrtcOffer {
                room: id.clone(),
                from: "alice".into(),
                to: Some("bob".into()),
                offer: serde_json::json!({"sdp": "x"}),
            },
        );
        assert_eq!(drain(&mut alice, 1).len(), 1);
    }

    #[test]
    fn test_fanout_delivery_rule() {
        let ev = ServerEvent::UserLeft { username: "x".into() };
        assert!(!Fanout::except(1, ev.clone()).delivers_to(1));
        assert!(Fanout::except(1, ev.clone()).delivers_to(2));
        assert!(Fanout::all(1, ev).delivers_to(1));
    }
}
