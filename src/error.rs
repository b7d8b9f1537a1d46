//! Error taxonomy for the script runtime.
//!
//! [`ScriptError`] is the one error type that crosses the host/script
//! boundary. Bridge handlers return it, the pending-request arena carries it
//! back to the script, and the Lua side surfaces it as the
//! `nil, message, kind` triple.
//!
//! Orchestration code (store, config, lifecycle) keeps using `anyhow`.

use serde::{Deserialize, Serialize};

use crate::script::Capability;

/// Best-effort location information for a script that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileDiagnostic {
    /// Interpreter message with the chunk-name prefix removed.
    pub message: String,
    /// 1-based line number, when the interpreter reported one.
    pub line: Option<u32>,
    /// 1-based column, estimated from the `near '<token>'` hint.
    pub column: Option<u32>,
    /// The offending source line, trimmed.
    pub context: Option<String>,
}

impl std::fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(col)) => write!(f, "line {line}:{col}: {}", self.message)?,
            (Some(line), None) => write!(f, "line {line}: {}", self.message)?,
            _ => write!(f, "{}", self.message)?,
        }
        if let Some(ref context) = self.context {
            write!(f, " (near `{context}`)")?;
        }
        Ok(())
    }
}

/// Failure of a bridge action or of a script's execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "PascalCase")]
pub enum ScriptError {
    /// The capability gating this action is switched off for the script.
    PermissionDenied {
        /// Action name as requested by the script.
        action: String,
        /// Capability that is disabled.
        capability: Capability,
    },
    /// The action requires a trusted script and the script is not trusted.
    TrustRequired {
        /// Action name as requested by the script.
        action: String,
    },
    /// The action name is not part of the bridge table.
    UnknownAction {
        /// Action name as requested by the script.
        action: String,
    },
    /// Malformed or oversized payload, or a rejected network target.
    Validation {
        /// Human-readable reason.
        message: String,
    },
    /// The script source failed to parse.
    Compile {
        /// Location details.
        diagnostic: CompileDiagnostic,
    },
    /// Uncaught error during execution.
    Runtime {
        /// Interpreter error text.
        message: String,
    },
    /// Network or socket failure.
    Transport {
        /// Human-readable reason.
        message: String,
    },
    /// The request was still in flight when its script was stopped.
    Stopped,
}

impl ScriptError {
    /// Build a [`ScriptError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Build a [`ScriptError::Transport`].
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Build a [`ScriptError::Runtime`].
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Stable name of the variant, exposed to scripts as the third return value.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::TrustRequired { .. } => "TrustRequired",
            Self::UnknownAction { .. } => "UnknownAction",
            Self::Validation { .. } => "ValidationError",
            Self::Compile { .. } => "CompileError",
            Self::Runtime { .. } => "RuntimeError",
            Self::Transport { .. } => "TransportError",
            Self::Stopped => "StoppedError",
        }
    }

    /// Whether this is a permission-gate rejection (capability or trust).
    #[must_use]
    pub fn is_gate_rejection(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. } | Self::TrustRequired { .. })
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied { action, capability } => write!(
                f,
                "Permission denied: {action} needs the '{}' capability",
                capability.name()
            ),
            Self::TrustRequired { action } => {
                write!(f, "Trust required: {action} is only available to trusted scripts")
            }
            Self::UnknownAction { action } => write!(f, "Unknown action: {action}"),
            Self::Validation { message } => write!(f, "Invalid request: {message}"),
            Self::Compile { diagnostic } => write!(f, "Compile error: {diagnostic}"),
            Self::Runtime { message } => write!(f, "Runtime error: {message}"),
            Self::Transport { message } => write!(f, "Transport error: {message}"),
            Self::Stopped => write!(f, "Script stopped before the request completed"),
        }
    }
}

impl std::error::Error for ScriptError {}
