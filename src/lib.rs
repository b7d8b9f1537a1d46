//! Scriptbox - sandboxed Lua automation runtime.
//!
//! Users write small Lua scripts that automate a surrounding desktop
//! application. Each script runs on its own worker thread inside a locked-down
//! interpreter and reaches the outside world only by sending requests to the
//! host, which checks them against the script's trust flag and capability
//! toggles before doing anything.
//!
//! # Architecture
//!
//! - **Script Store** - persisted script records ([`script`])
//! - **Security** - source sanitizer, network target validation and the
//!   permission gate ([`security`])
//! - **Lua worker** - sandbox, compiler and the `host`/`log`/`json` primitives ([`lua`])
//! - **Execution Host / Lifecycle** - one host per running script, owned by
//!   [`ScriptRuntimeManager`] ([`runtime`])
//! - **Host RPC Bridge** - the action handlers scripts call ([`bridge`])
//! - **Collaborators** - the surrounding application ([`app`]) and the
//!   settings store ([`settings`])
//!
//! # Modules
//!
//! - [`config`] - Configuration loading/saving
//! - [`commands`] - CLI subcommand implementations
//! - [`error`] - Script-facing error taxonomy
//! - [`file_watcher`] - File change notifications for `scriptbox run`
//! - [`ws`] - WebSocket client used by the bridge

pub mod app;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod file_watcher;
pub mod lua;
pub mod runtime;
pub mod script;
pub mod security;
pub mod settings;
pub mod ws;

// Re-export commonly used types
pub use app::{HeadlessApplication, HostApplication, WindowSnapshot};
pub use config::Config;
pub use error::{CompileDiagnostic, ScriptError};
pub use runtime::{ScriptRuntimeManager, ScriptStatus};
pub use script::{Capability, ManagedScript, ScriptDraft, ScriptPermissions, ScriptStore};
pub use settings::{JsonFileSettings, MemorySettings, SettingsStore};
