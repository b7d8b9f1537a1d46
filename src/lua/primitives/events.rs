//! Event subscriptions for scripts.
//!
//! Scripts subscribe to host events with `host.on` and unsubscribe with
//! `host.off`. The worker looks handlers up here when a `host-event` message
//! arrives and runs them one after another, in arrival order.
//!
//! # Usage in Lua
//!
//! ```lua
//! local sub = host.on("window.updated", function(snapshot, event)
//!     log.info(event .. ": " .. #snapshot.accounts .. " accounts")
//! end)
//!
//! host.on("ws.message", function(msg) log.debug(msg.data) end)
//!
//! host.off(sub)
//! ```
//!
//! A script with at least one subscription keeps running after its main
//! chunk returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use mlua::prelude::*;

/// Unique identifier for an event subscription.
pub type EventCallbackId = String;

/// Maximum event name length accepted by `host.on`.
const MAX_EVENT_NAME_LEN: usize = 128;

/// Storage for event callbacks registered by a script.
///
/// Callbacks live in the Lua registry so they aren't collected. Each event
/// name maps to `(callback_id, registry_key)` pairs in subscription order.
#[derive(Default)]
pub struct EventCallbacks {
    callbacks: HashMap<String, Vec<(EventCallbackId, LuaRegistryKey)>>,
    next_id: u64,
}

impl std::fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("event_count", &self.callbacks.len())
            .field("total_callbacks", &self.callback_count())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl EventCallbacks {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to `event`, returning the subscription id.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry value can't be created.
    pub fn register(
        &mut self,
        lua: &Lua,
        event: &str,
        callback: LuaFunction,
    ) -> Result<EventCallbackId> {
        self.next_id += 1;
        let id = format!("evt_{}", self.next_id);

        let key = lua
            .create_registry_value(callback)
            .map_err(|e| anyhow!("Failed to create registry value: {e}"))?;

        self.callbacks
            .entry(event.to_string())
            .or_default()
            .push((id.clone(), key));

        log::debug!("[runtime] Registered event callback '{id}' for '{event}'");
        Ok(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unregister(&mut self, lua: &Lua, subscription_id: &str) -> bool {
        let mut removed = None;
        for callbacks in self.callbacks.values_mut() {
            if let Some(idx) = callbacks.iter().position(|(id, _)| id == subscription_id) {
                removed = Some(callbacks.remove(idx));
                break;
            }
        }
        self.callbacks.retain(|_, v| !v.is_empty());

        let Some((id, key)) = removed else {
            return false;
        };
        if let Err(e) = lua.remove_registry_value(key) {
            log::warn!("[runtime] Failed to remove registry value for {id}: {e}");
        }
        true
    }

    /// Functions subscribed to `event`, in subscription order.
    ///
    /// The returned handles are independent of the registry, so the caller
    /// can run them after releasing any lock on `self`.
    #[must_use]
    pub fn handlers(&self, lua: &Lua, event: &str) -> Vec<LuaFunction> {
        self.callbacks
            .get(event)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(_, key)| lua.registry_value::<LuaFunction>(key).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether anything is subscribed to `event`.
    #[must_use]
    pub fn has_callbacks(&self, event: &str) -> bool {
        self.callbacks.get(event).is_some_and(|v| !v.is_empty())
    }

    /// Total number of subscriptions.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.values().map(Vec::len).sum()
    }
}

/// Shared reference to a script's event callbacks.
pub type SharedEventCallbacks = Arc<Mutex<EventCallbacks>>;

/// Create an empty shared registry.
#[must_use]
pub fn new_event_callbacks() -> SharedEventCallbacks {
    Arc::new(Mutex::new(EventCallbacks::new()))
}

/// Add `on`, `off` and `has` to the `host` table.
///
/// # Errors
///
/// Returns an error if Lua function creation fails.
pub fn register(lua: &Lua, host: &LuaTable, callbacks: &SharedEventCallbacks) -> Result<()> {
    // host.on(event, fn) -> subscription_id
    let cb = Arc::clone(callbacks);
    let on_fn = lua
        .create_function(move |lua, (event, callback): (String, LuaFunction)| {
            if event.is_empty() || event.len() > MAX_EVENT_NAME_LEN {
                return Err(LuaError::runtime(format!(
                    "host.on: event name must be 1-{MAX_EVENT_NAME_LEN} bytes"
                )));
            }
            cb.lock()
                .expect("Event callbacks mutex poisoned")
                .register(lua, &event, callback)
                .map_err(LuaError::external)
        })
        .map_err(|e| anyhow!("Failed to create host.on function: {e}"))?;
    host.set("on", on_fn)
        .map_err(|e| anyhow!("Failed to set host.on: {e}"))?;

    // host.off(subscription_id) -> bool
    let cb = Arc::clone(callbacks);
    let off_fn = lua
        .create_function(move |lua, subscription_id: String| {
            Ok(cb
                .lock()
                .expect("Event callbacks mutex poisoned")
                .unregister(lua, &subscription_id))
        })
        .map_err(|e| anyhow!("Failed to create host.off function: {e}"))?;
    host.set("off", off_fn)
        .map_err(|e| anyhow!("Failed to set host.off: {e}"))?;

    // host.has(event) -> bool
    let cb = Arc::clone(callbacks);
    let has_fn = lua
        .create_function(move |_, event: String| {
            Ok(cb
                .lock()
                .expect("Event callbacks mutex poisoned")
                .has_callbacks(&event))
        })
        .map_err(|e| anyhow!("Failed to create host.has function: {e}"))?;
    host.set("has", has_fn)
        .map_err(|e| anyhow!("Failed to set host.has: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Lua, SharedEventCallbacks) {
        let lua = Lua::new();
        let callbacks = new_event_callbacks();
        let host = lua.create_table().expect("table");
        register(&lua, &host, &callbacks).expect("Should register events primitives");
        lua.globals().set("host", host).expect("set host");
        (lua, callbacks)
    }

    #[test]
    fn test_on_and_off() {
        let (lua, callbacks) = setup();
        let id: String = lua
            .load(r#"return host.on("ws.open", function() end)"#)
            .eval()
            .expect("host.on");
        assert!(id.starts_with("evt_"));
        assert!(callbacks.lock().expect("lock").has_callbacks("ws.open"));

        let removed: bool = lua
            .load(format!(r#"return host.off("{id}")"#))
            .eval()
            .expect("host.off");
        assert!(removed);
        assert_eq!(callbacks.lock().expect("lock").callback_count(), 0);

        let again: bool = lua
            .load(format!(r#"return host.off("{id}")"#))
            .eval()
            .expect("host.off");
        assert!(!again);
    }

    #[test]
    fn test_handlers_in_subscription_order() {
        let (lua, callbacks) = setup();
        lua.load(
            r#"
            seen = {}
            host.on("tick", function(p) table.insert(seen, "a" .. p) end)
            host.on("tick", function(p) table.insert(seen, "b" .. p) end)
            host.on("other", function() table.insert(seen, "x") end)
        "#,
        )
        .exec()
        .expect("subscribe");

        let handlers = callbacks.lock().expect("lock").handlers(&lua, "tick");
        assert_eq!(handlers.len(), 2);
        for handler in handlers {
            handler.call::<()>(1).expect("call");
        }
        let seen: Vec<String> = lua.load("return seen").eval().expect("seen");
        assert_eq!(seen, vec!["a1".to_string(), "b1".to_string()]);
    }

    #[test]
    fn test_on_rejects_empty_event() {
        let (lua, _) = setup();
        let result = lua.load(r#"host.on("", function() end)"#).exec();
        assert!(result.is_err());
    }
}
