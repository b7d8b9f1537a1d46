//! The `host` table: bridge requests, sleeping and script metadata.
//!
//! `host.request(action, payload)` is the single door from script code to
//! the host. It posts a `host-request` and suspends the calling coroutine
//! until the matching `host-response` arrives, so several requests from
//! different coroutines can be in flight at once and complete in any order.
//!
//! # Usage in Lua
//!
//! ```lua
//! local res, err, kind = host.request("http.request", { url = "https://example.com" })
//! if not res then
//!     log.warn(kind .. ": " .. err)
//! end
//! host.sleep(500)
//! log.info("running as " .. host.script.name)
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use mlua::{Lua, LuaSerdeExt, Table, Value};
use tokio::sync::{mpsc, oneshot};

use super::json::{json_to_lua, lua_to_json};
use super::log::LogOutbox;
use crate::error::ScriptError;
use crate::runtime::protocol::{RequestId, ScriptMetadata, ScriptMessage};

/// Longest single `host.sleep`.
pub const MAX_SLEEP_MS: u64 = 60_000;

type Outcome = std::result::Result<serde_json::Value, ScriptError>;

/// Worker-side end of the request/response correlation.
///
/// Lives on the worker thread only.
#[derive(Debug)]
pub struct HostLink {
    outbox: mpsc::Sender<ScriptMessage>,
    logs: Rc<LogOutbox>,
    waiting: RefCell<HashMap<RequestId, oneshot::Sender<Outcome>>>,
    next_id: Cell<RequestId>,
}

impl HostLink {
    /// Link posting requests on `outbox`, behind any lines `logs` holds.
    #[must_use]
    pub fn new(outbox: mpsc::Sender<ScriptMessage>, logs: Rc<LogOutbox>) -> Rc<Self> {
        Rc::new(Self {
            outbox,
            logs,
            waiting: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        })
    }

    /// Hand a `host-response` to the coroutine waiting for it.
    ///
    /// Returns `false` for ids nobody is waiting on.
    pub fn resolve(&self, request_id: RequestId, outcome: Outcome) -> bool {
        match self.waiting.borrow_mut().remove(&request_id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.waiting.borrow().len()
    }

    async fn request(&self, action: String, payload: serde_json::Value) -> Outcome {
        let request_id = self.next_id.get() + 1;
        self.next_id.set(request_id);

        let (tx, rx) = oneshot::channel();
        self.waiting.borrow_mut().insert(request_id, tx);

        let msg = ScriptMessage::HostRequest {
            request_id,
            action,
            payload,
        };
        self.logs.flush().await;
        if self.outbox.send(msg).await.is_err() {
            self.waiting.borrow_mut().remove(&request_id);
            return Err(ScriptError::Stopped);
        }
        // A dropped sender means the worker is shutting down.
        rx.await.unwrap_or(Err(ScriptError::Stopped))
    }
}

/// Populate `host` with `request`, `sleep` and `script`.
///
/// # Errors
///
/// Returns an error if Lua function or table creation fails.
pub fn register(
    lua: &Lua,
    host: &Table,
    link: &Rc<HostLink>,
    metadata: &ScriptMetadata,
) -> Result<()> {
    // host.request(action, payload) -> value, nil, nil | nil, message, kind
    let request_link = Rc::clone(link);
    let request_fn = lua
        .create_async_function(move |lua, (action, payload): (String, Value)| {
            let link = Rc::clone(&request_link);
            async move {
                let payload = match lua_to_json(&lua, payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        let err = ScriptError::validation(format!("{action}: payload is not JSON: {e}"));
                        return Ok((Value::Nil, Some(err.to_string()), Some(err.kind().to_string())));
                    }
                };
                match link.request(action, payload).await {
                    Ok(result) => Ok((json_to_lua(&lua, &result)?, None, None)),
                    Err(ScriptError::Stopped) => Err(mlua::Error::runtime("script stopped")),
                    Err(e) => Ok((Value::Nil, Some(e.to_string()), Some(e.kind().to_string()))),
                }
            }
        })
        .map_err(|e| anyhow!("Failed to create host.request function: {e}"))?;
    host.set("request", request_fn)
        .map_err(|e| anyhow!("Failed to set host.request: {e}"))?;

    // host.sleep(ms)
    let sleep_fn = lua
        .create_async_function(|_, ms: f64| async move {
            if !ms.is_finite() || ms < 0.0 {
                return Err(mlua::Error::runtime("host.sleep: expected a non-negative number"));
            }
            let ms = (ms as u64).min(MAX_SLEEP_MS);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create host.sleep function: {e}"))?;
    host.set("sleep", sleep_fn)
        .map_err(|e| anyhow!("Failed to set host.sleep: {e}"))?;

    // host.script: read-only snapshot of the script's metadata.
    let script = lua
        .to_value(metadata)
        .map_err(|e| anyhow!("Failed to convert script metadata: {e}"))?;
    host.set("script", script)
        .map_err(|e| anyhow!("Failed to set host.script: {e}"))?;

    Ok(())
}
