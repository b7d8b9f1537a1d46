//! Lua primitive functions exposed to scripts.
//!
//! # Available Primitives
//!
//! - `log` - Forward log lines to the host (`debug`, `info`, `warn`, `error`; also `print`)
//! - `json` - JSON encode/decode
//! - `host` - Bridge requests, `sleep`, script metadata
//! - `events` - `host.on` / `host.off` subscriptions
//!
//! Everything else a script can do (HTTP, WebSocket, modals, settings, UI)
//! is a bridge action reached through `host.request`; the embedded prelude
//! wraps those in friendlier functions.
//!
//! # Adding New Primitives
//!
//! 1. Create a new module (e.g., `foo.rs`)
//! 2. Implement a `register(lua, ...) -> Result<()>` function
//! 3. Add `pub mod foo;` here
//! 4. Call `foo::register(...)?;` in `register_all`

pub mod events;
pub mod host;
pub mod json;
pub mod log;

use std::rc::Rc;

use anyhow::{anyhow, Result};
use mlua::Lua;
use crate::runtime::protocol::ScriptMetadata;

pub use events::{new_event_callbacks, EventCallbackId, EventCallbacks, SharedEventCallbacks};
pub use host::HostLink;
pub use json::{json_to_lua, lua_to_json};
pub use log::LogOutbox;

/// Register every primitive into `lua`.
///
/// # Errors
///
/// Returns an error if any registration fails.
pub fn register_all(
    lua: &Lua,
    logs: &Rc<LogOutbox>,
    link: &Rc<HostLink>,
    callbacks: &SharedEventCallbacks,
    metadata: &ScriptMetadata,
) -> Result<()> {
    log::register(lua, logs)?;
    json::register(lua)?;

    let host = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create host table: {e}"))?;
    host::register(lua, &host, link, metadata)?;
    events::register(lua, &host, callbacks)?;
    lua.globals()
        .set("host", host)
        .map_err(|e| anyhow!("Failed to register host table globally: {e}"))?;

    Ok(())
}
