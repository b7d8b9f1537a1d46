//! Host RPC bridge.
//!
//! Every side effect a script can cause goes through [`HostBridge::dispatch`]:
//! the action name is looked up in the policy table, the permission gate
//! runs, the payload is validated, and only then does the handler touch the
//! application, the network or the settings store.
//!
//! Handlers never panic the host. Every failure becomes a [`ScriptError`]
//! that rejects the originating request.

pub mod application;
pub mod http;
pub mod modal;
pub mod settings;
pub mod ui;
pub mod websocket;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::app::HostApplication;
use crate::config::Config;
use crate::error::ScriptError;
use crate::runtime::protocol::{HostMessage, LogLevel};
use crate::runtime::state::{LogSource, SharedRecords};
use crate::script::ManagedScript;
use crate::security::{authorize_action, BridgeAction};
use crate::settings::SettingsStore;

pub use websocket::{SharedConnections, WsConnections, WsState};

/// Per-host view handed to every handler.
#[derive(Debug)]
pub struct RequestContext {
    /// Script snapshot taken when the host started.
    pub script: ManagedScript,
    /// Channel for pushing events (WebSocket lifecycle) to the worker.
    pub to_script: mpsc::Sender<HostMessage>,
    /// Sockets owned by this host.
    pub connections: SharedConnections,
}

/// Shared collaborators for all hosts.
pub struct HostBridge {
    config: Arc<Config>,
    app: Arc<dyn HostApplication>,
    settings: Arc<dyn SettingsStore>,
    records: SharedRecords,
    http: http::HttpClients,
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HostBridge {
    /// Wire the bridge to its collaborators.
    pub fn new(
        config: Arc<Config>,
        app: Arc<dyn HostApplication>,
        settings: Arc<dyn SettingsStore>,
        records: SharedRecords,
    ) -> anyhow::Result<Self> {
        let http = http::HttpClients::new()?;
        Ok(Self {
            config,
            app,
            settings,
            records,
            http,
        })
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Application collaborator.
    #[must_use]
    pub fn app(&self) -> &Arc<dyn HostApplication> {
        &self.app
    }

    /// Per-script records.
    #[must_use]
    pub fn records(&self) -> &SharedRecords {
        &self.records
    }

    /// Authorize and perform one action.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        action: &str,
        payload: Value,
    ) -> Result<Value, ScriptError> {
        let policy = match authorize_action(&ctx.script, action) {
            Ok(policy) => policy,
            Err(e) => {
                if e.is_gate_rejection() {
                    self.records
                        .lock()
                        .expect("RuntimeRecords mutex poisoned")
                        .append_log(&ctx.script.id, LogLevel::Warn, LogSource::Host, &e.to_string());
                }
                return Err(e);
            }
        };

        let result = match policy.action {
            BridgeAction::Invoke => application::invoke(self, payload).await,
            BridgeAction::WindowSnapshot => application::snapshot(self).await,
            BridgeAction::WindowAccounts => application::accounts(self).await,
            BridgeAction::WindowSelected => application::selected(self).await,
            BridgeAction::HttpRequest => {
                http::request(&self.http, &self.config, payload).await
            }
            BridgeAction::WsConnect => websocket::connect(&self.config, ctx, payload),
            BridgeAction::WsSend => websocket::send(&self.config, ctx, payload).await,
            BridgeAction::WsClose => websocket::close(ctx, payload),
            BridgeAction::WsList => websocket::list(ctx),
            BridgeAction::SettingsGet => settings::get(self.settings.as_ref(), &ctx.script, payload),
            BridgeAction::SettingsSet => settings::set(self.settings.as_ref(), &ctx.script, payload),
            BridgeAction::SettingsAll => settings::all(self.settings.as_ref(), &ctx.script),
            BridgeAction::ModalAlert => modal::alert(self.app.as_ref(), payload).await,
            BridgeAction::ModalConfirm => modal::confirm(self.app.as_ref(), payload).await,
            BridgeAction::ModalPrompt => modal::prompt(self.app.as_ref(), payload).await,
            BridgeAction::ModalJson => modal::json(self.app.as_ref(), payload).await,
            BridgeAction::UiSet => ui::set(&self.records, &ctx.script.id, payload),
            BridgeAction::UiPatch => ui::patch(&self.records, &ctx.script.id, payload),
            BridgeAction::UiClear => ui::clear(&self.records, &ctx.script.id),
        };

        if let Err(ref e) = result {
            log::debug!("[bridge] {} {action} failed: {e}", ctx.script.id);
        }
        result
    }
}

/// Deserialize a payload into a typed request.
///
/// `nil`, `{}` and `[]` all mean "no fields" (Lua can't tell an empty
/// table's shape).
pub(crate) fn parse_payload<T: DeserializeOwned>(action: &str, payload: Value) -> Result<T, ScriptError> {
    let payload = match payload {
        Value::Null => Value::Object(Map::new()),
        Value::Array(items) if items.is_empty() => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(payload)
        .map_err(|e| ScriptError::validation(format!("{action}: {e}")))
}

/// Fail when `text` is longer than `max` characters.
pub(crate) fn check_len(field: &str, text: &str, max: usize) -> Result<(), ScriptError> {
    if text.chars().count() > max {
        return Err(ScriptError::validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}
