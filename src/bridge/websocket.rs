//! `ws.*`: WebSocket connections owned by one Execution Host.
//!
//! Each connection is a tokio task holding the socket. The host-side table
//! keeps the task's state (`watch`) and command channel, so `ws.send` can
//! wait for a connecting socket and `stop` can close everything without
//! touching the sockets directly.
//!
//! Socket lifecycle is reported to the script as host events, not as
//! responses to `ws.connect`:
//!
//! | event        | payload                       |
//! |--------------|-------------------------------|
//! | `ws.open`    | `{id, url}`                   |
//! | `ws.message` | `{id, data, binary}`          |
//! | `ws.error`   | `{id, message}`               |
//! | `ws.close`   | `{id, code, reason}`          |

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use super::{parse_payload, RequestContext};
use crate::config::Config;
use crate::error::ScriptError;
use crate::runtime::protocol::HostMessage;
use crate::security::network::resolve_target;
use crate::security::{validate_network_target, NetworkScheme};
use crate::ws::{self, WsMessage, CLOSE_NORMAL};

/// Maximum outgoing message size.
pub const MAX_WS_MESSAGE_BYTES: usize = 256 * 1024;
/// Maximum connection id length.
pub const MAX_CONNECTION_ID_LEN: usize = 64;
/// Close reasons are limited by the protocol to 123 bytes.
const MAX_CLOSE_REASON_BYTES: usize = 123;
/// Time allowed for a graceful close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WsState {
    /// Handshake in progress.
    Connecting,
    /// Ready to send.
    Open,
    /// Finished, for whatever reason.
    Closed,
}

#[derive(Debug)]
enum WsCommand {
    Send(String),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct WsHandle {
    url: String,
    serial: u64,
    state: watch::Receiver<WsState>,
    commands: mpsc::Sender<WsCommand>,
    task: AbortHandle,
}

impl WsHandle {
    fn request_close(&self, code: u16, reason: &str) {
        let cmd = WsCommand::Close {
            code,
            reason: reason.to_string(),
        };
        if self.commands.try_send(cmd).is_err() {
            // Queue full or task gone: no graceful close possible.
            self.task.abort();
        }
    }
}

/// Sockets owned by one Execution Host, keyed by connection id.
#[derive(Debug, Default)]
pub struct WsConnections {
    entries: BTreeMap<String, WsHandle>,
    next_serial: u64,
    next_auto_id: u64,
}

/// Shared handle to a host's connection table.
pub type SharedConnections = Arc<Mutex<WsConnections>>;

impl WsConnections {
    /// Empty shared table.
    #[must_use]
    pub fn new_shared() -> SharedConnections {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no connection is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every connection gracefully and forget them.
    ///
    /// Returns the ids that were closed.
    pub fn close_all(&mut self, code: u16, reason: &str) -> Vec<String> {
        let entries = std::mem::take(&mut self.entries);
        entries
            .into_iter()
            .map(|(id, handle)| {
                handle.request_close(code, reason);
                id
            })
            .collect()
    }

    fn remove_if_current(&mut self, id: &str, serial: u64) {
        if self.entries.get(id).is_some_and(|h| h.serial == serial) {
            self.entries.remove(id);
        }
    }
}

fn validate_connection_id(id: &str) -> Result<(), ScriptError> {
    if id.is_empty() || id.len() > MAX_CONNECTION_ID_LEN {
        return Err(ScriptError::validation(format!(
            "connection id must be 1-{MAX_CONNECTION_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(ScriptError::validation(format!(
            "connection id '{id}' may only contain letters, digits, '_', '.' and '-'"
        )));
    }
    Ok(())
}

fn validate_close(code: u16, reason: &str) -> Result<(), ScriptError> {
    if code != CLOSE_NORMAL && !(3000..=4999).contains(&code) {
        return Err(ScriptError::validation(format!(
            "close code {code} is not allowed (use 1000 or 3000-4999)"
        )));
    }
    if reason.len() > MAX_CLOSE_REASON_BYTES {
        return Err(ScriptError::validation(format!(
            "close reason exceeds {MAX_CLOSE_REASON_BYTES} bytes"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPayload {
    url: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    protocols: Vec<String>,
    #[serde(default)]
    allow_private_network: bool,
}

#[derive(Debug, Deserialize)]
struct SendPayload {
    id: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    json: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ClosePayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    reason: Option<String>,
}

/// Everything a connection task needs.
struct ConnectionTask {
    id: String,
    serial: u64,
    url: url::Url,
    headers: Vec<(String, String)>,
    protocols: Vec<String>,
    allow_private: bool,
    connect_timeout: Duration,
    state: watch::Sender<WsState>,
    commands: mpsc::Receiver<WsCommand>,
    to_script: mpsc::Sender<HostMessage>,
    connections: SharedConnections,
}

impl ConnectionTask {
    async fn emit(&self, event: &str, payload: Value) {
        let msg = HostMessage::HostEvent {
            event: event.to_string(),
            payload,
        };
        if self.to_script.send(msg).await.is_err() {
            log::debug!("[websocket] {}: worker gone, dropped {event}", self.id);
        }
    }

    async fn run(mut self) {
        let connect = tokio::time::timeout(
            self.connect_timeout,
            establish(
                self.url.clone(),
                std::mem::take(&mut self.headers),
                std::mem::take(&mut self.protocols),
                self.allow_private,
            ),
        );
        tokio::pin!(connect);

        let pair = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(Ok(pair)) => break Some(pair),
                    Ok(Err(e)) => {
                        self.emit("ws.error", json!({"id": self.id, "message": e.to_string()})).await;
                        break None;
                    }
                    Err(_) => {
                        let message = format!("connect timed out after {:?}", self.connect_timeout);
                        self.emit("ws.error", json!({"id": self.id, "message": message})).await;
                        break None;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(WsCommand::Close { code, reason }) => {
                        self.emit("ws.close", json!({"id": self.id, "code": code, "reason": reason})).await;
                        self.finish();
                        return;
                    }
                    // Sends wait for Open before queueing.
                    Some(WsCommand::Send(_)) => continue,
                    None => {
                        self.finish();
                        return;
                    }
                },
            }
        };

        let Some((mut writer, mut reader)) = pair else {
            self.emit(
                "ws.close",
                json!({"id": self.id, "code": 1006, "reason": "connection failed"}),
            )
            .await;
            self.finish();
            return;
        };

        self.state.send_replace(WsState::Open);
        log::info!("[websocket] {} connected to {}", self.id, self.url);
        self.emit("ws.open", json!({"id": self.id, "url": self.url.as_str()})).await;

        loop {
            tokio::select! {
                frame = reader.recv() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.emit("ws.message", json!({"id": self.id, "data": text, "binary": false})).await;
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        let text = String::from_utf8_lossy(&data).into_owned();
                        self.emit("ws.message", json!({"id": self.id, "data": text, "binary": true})).await;
                    }
                    Some(Ok(WsMessage::Ping(_))) => {
                        // tungstenite queues the pong itself.
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        self.emit("ws.close", json!({"id": self.id, "code": code, "reason": reason})).await;
                        break;
                    }
                    Some(Err(e)) => {
                        self.emit("ws.error", json!({"id": self.id, "message": format!("{e:#}")})).await;
                        self.emit("ws.close", json!({"id": self.id, "code": 1006, "reason": "read error"})).await;
                        break;
                    }
                    None => {
                        self.emit("ws.close", json!({"id": self.id, "code": 1006, "reason": "stream ended"})).await;
                        break;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(WsCommand::Send(text)) => {
                        if let Err(e) = writer.send_text(text).await {
                            self.emit("ws.error", json!({"id": self.id, "message": format!("{e:#}")})).await;
                            self.emit("ws.close", json!({"id": self.id, "code": 1006, "reason": "send failed"})).await;
                            break;
                        }
                    }
                    Some(WsCommand::Close { code, reason }) => {
                        if tokio::time::timeout(CLOSE_GRACE, writer.send_close(code, &reason)).await.is_err() {
                            log::debug!("[websocket] {}: close handshake timed out", self.id);
                        }
                        self.emit("ws.close", json!({"id": self.id, "code": code, "reason": reason})).await;
                        break;
                    }
                    None => break,
                },
            }
        }

        self.finish();
    }

    fn finish(&self) {
        self.state.send_replace(WsState::Closed);
        self.connections
            .lock()
            .expect("WsConnections mutex poisoned")
            .remove_if_current(&self.id, self.serial);
        log::debug!("[websocket] {} closed", self.id);
    }
}

/// Resolve the target once and dial exactly the vetted addresses.
async fn establish(
    url: url::Url,
    headers: Vec<(String, String)>,
    protocols: Vec<String>,
    allow_private: bool,
) -> Result<(ws::WsWriter, ws::WsReader), ScriptError> {
    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain.to_string(),
        Some(url::Host::Ipv4(ip)) => ip.to_string(),
        Some(url::Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(ScriptError::validation(format!("{url} has no host"))),
    };
    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = resolve_target(&host, port, allow_private).await?;
    ws::connect(&url, &addrs, &headers, &protocols)
        .await
        .map_err(|e| ScriptError::transport(format!("{e:#}")))
}

pub(crate) fn connect(
    config: &Config,
    ctx: &RequestContext,
    payload: Value,
) -> Result<Value, ScriptError> {
    let payload: ConnectPayload = parse_payload("ws.connect", payload)?;
    let url = validate_network_target(
        &payload.url,
        NetworkScheme::WebSocket,
        payload.allow_private_network,
    )?;
    let headers: Vec<(String, String)> = super::http::build_headers(&payload.headers)?
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    for protocol in &payload.protocols {
        if protocol.is_empty() || !protocol.chars().all(|c| c.is_ascii_graphic() && c != ',') {
            return Err(ScriptError::validation(format!(
                "invalid sub-protocol '{protocol}'"
            )));
        }
    }

    let mut table = ctx.connections.lock().expect("WsConnections mutex poisoned");

    let id = match payload.id {
        Some(id) => {
            validate_connection_id(&id)?;
            if table.entries.contains_key(&id) {
                return Err(ScriptError::validation(format!(
                    "connection id '{id}' is already in use"
                )));
            }
            id
        }
        None => loop {
            table.next_auto_id += 1;
            let candidate = format!("ws-{}", table.next_auto_id);
            if !table.entries.contains_key(&candidate) {
                break candidate;
            }
        },
    };

    if table.entries.len() >= config.max_connections_per_script {
        return Err(ScriptError::validation(format!(
            "too many WebSocket connections (limit: {})",
            config.max_connections_per_script
        )));
    }

    table.next_serial += 1;
    let serial = table.next_serial;
    let (state_tx, state_rx) = watch::channel(WsState::Connecting);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    let task = ConnectionTask {
        id: id.clone(),
        serial,
        url: url.clone(),
        headers,
        protocols: payload.protocols,
        allow_private: payload.allow_private_network,
        connect_timeout: Duration::from_millis(config.ws_connect_timeout_ms),
        state: state_tx,
        commands: cmd_rx,
        to_script: ctx.to_script.clone(),
        connections: Arc::clone(&ctx.connections),
    };
    // The task can't reach `finish` (which locks the table) before the
    // entry below is inserted: we still hold the lock.
    let handle = tokio::spawn(task.run());

    table.entries.insert(
        id.clone(),
        WsHandle {
            url: url.to_string(),
            serial,
            state: state_rx,
            commands: cmd_tx,
            task: handle.abort_handle(),
        },
    );
    log::debug!("[websocket] {} connecting to {url}", id);

    Ok(json!({ "id": id }))
}

pub(crate) async fn send(
    config: &Config,
    ctx: &RequestContext,
    payload: Value,
) -> Result<Value, ScriptError> {
    let payload: SendPayload = parse_payload("ws.send", payload)?;
    let text = match (payload.data, payload.json) {
        (Some(data), None) => data,
        (None, Some(value)) => serde_json::to_string(&value)
            .map_err(|e| ScriptError::validation(format!("ws.send json: {e}")))?,
        _ => {
            return Err(ScriptError::validation(
                "ws.send needs exactly one of data or json",
            ))
        }
    };
    if text.len() > MAX_WS_MESSAGE_BYTES {
        return Err(ScriptError::validation(format!(
            "message exceeds {MAX_WS_MESSAGE_BYTES} bytes"
        )));
    }

    let (mut state, commands) = {
        let table = ctx.connections.lock().expect("WsConnections mutex poisoned");
        let handle = table.entries.get(&payload.id).ok_or_else(|| {
            ScriptError::validation(format!("unknown connection '{}'", payload.id))
        })?;
        (handle.state.clone(), handle.commands.clone())
    };

    let wait = Duration::from_millis(config.ws_send_wait_ms);
    let current = match tokio::time::timeout(wait, state.wait_for(|s| *s != WsState::Connecting)).await {
        Ok(Ok(current)) => *current,
        Ok(Err(_)) => WsState::Closed,
        Err(_) => {
            return Err(ScriptError::transport(format!(
                "connection '{}' did not open within {wait:?}",
                payload.id
            )))
        }
    };
    if current == WsState::Closed {
        return Err(ScriptError::transport(format!(
            "connection '{}' is closed",
            payload.id
        )));
    }

    commands
        .send(WsCommand::Send(text))
        .await
        .map_err(|e| {
            ScriptError::transport(format!("connection '{}' is closed: {e}", payload.id))
        })?;
    Ok(json!({ "sent": true }))
}

pub(crate) fn close(ctx: &RequestContext, payload: Value) -> Result<Value, ScriptError> {
    let payload: ClosePayload = parse_payload("ws.close", payload)?;
    let code = payload.code.unwrap_or(CLOSE_NORMAL);
    let reason = payload.reason.unwrap_or_default();
    validate_close(code, &reason)?;

    let mut table = ctx.connections.lock().expect("WsConnections mutex poisoned");
    let closed = match payload.id {
        Some(id) => {
            let handle = table
                .entries
                .remove(&id)
                .ok_or_else(|| ScriptError::validation(format!("unknown connection '{id}'")))?;
            handle.request_close(code, &reason);
            vec![id]
        }
        None => table.close_all(code, &reason),
    };
    Ok(json!({ "closed": closed }))
}

pub(crate) fn list(ctx: &RequestContext) -> Result<Value, ScriptError> {
    let table = ctx.connections.lock().expect("WsConnections mutex poisoned");
    let entries: Vec<Value> = table
        .entries
        .iter()
        .map(|(id, handle)| {
            json!({
                "id": id,
                "url": handle.url,
                "state": *handle.state.borrow(),
            })
        })
        .collect();
    Ok(Value::Array(entries))
}
