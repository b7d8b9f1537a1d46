//! Host <-> script message protocol.
//!
//! The two enums below are the only things that cross the channel pair
//! between an [`ExecutionHost`](super::host::ExecutionHost) and its worker
//! thread. They carry owned, `Send` data only; no interpreter values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ScriptError;
use crate::script::{ManagedScript, ScriptPermissions};

/// Correlates a `host-request` with its `host-response`.
pub type RequestId = u64;

/// Script facts exposed to the running code as `host.script`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptMetadata {
    /// Script id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Trust flag at start time.
    pub trusted: bool,
    /// Capability toggles at start time.
    pub permissions: ScriptPermissions,
}

impl From<&ManagedScript> for ScriptMetadata {
    fn from(script: &ManagedScript) -> Self {
        Self {
            id: script.id.clone(),
            name: script.name.clone(),
            description: script.description.clone(),
            trusted: script.trusted,
            permissions: script.permissions,
        }
    }
}

/// Messages from the host to a script worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HostMessage {
    /// Compile and run `code`.
    Start {
        /// Sanitized source.
        code: String,
        /// Exposed as `host.script`.
        metadata: ScriptMetadata,
    },
    /// Tear down the worker.
    Stop,
    /// Deliver an event to `host.on` handlers.
    HostEvent {
        /// Event name, e.g. `window.updated`.
        event: String,
        /// Event payload.
        payload: Value,
    },
    /// Answer a `host-request`.
    HostResponse {
        /// Id of the request being answered.
        request_id: RequestId,
        /// `true` when `result` is set, `false` when `error` is set.
        ok: bool,
        /// Success value.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ScriptError>,
    },
}

impl HostMessage {
    /// Build a `host-response` from a bridge outcome.
    #[must_use]
    pub fn response(request_id: RequestId, outcome: Result<Value, ScriptError>) -> Self {
        match outcome {
            Ok(value) => Self::HostResponse {
                request_id,
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(error) => Self::HostResponse {
                request_id,
                ok: false,
                result: None,
                error: Some(error),
            },
        }
    }
}

/// Severity of a `host-log` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `log.debug`
    Debug,
    /// `log.info`
    Info,
    /// `log.warn`
    Warn,
    /// `log.error`
    Error,
}

impl LogLevel {
    /// Matching `log` crate level.
    #[must_use]
    pub fn as_log_level(self) -> log::Level {
        match self {
            Self::Debug => log::Level::Debug,
            Self::Info => log::Level::Info,
            Self::Warn => log::Level::Warn,
            Self::Error => log::Level::Error,
        }
    }
}

/// Messages from a script worker to its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ScriptMessage {
    /// Ask the host to perform a bridge action.
    HostRequest {
        /// Worker-generated correlation id.
        request_id: RequestId,
        /// Action name, e.g. `http.request`.
        action: String,
        /// Action payload.
        payload: Value,
    },
    /// A `log.*` call from script code.
    HostLog {
        /// Severity.
        level: LogLevel,
        /// Message text (not yet truncated).
        message: String,
    },
    /// Main chunk returned and no handlers remain.
    ScriptFinished,
    /// Compile failure or uncaught error.
    ScriptError {
        /// What went wrong.
        error: ScriptError,
    },
}
