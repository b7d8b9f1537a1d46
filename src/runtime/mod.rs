//! Script runtime: execution hosts and the lifecycle manager that owns them.
//!
//! ```text
//! ScriptRuntimeManager ──owns──▶ ExecutionHost (one per running script)
//!        │                          │   pump task ──▶ HostBridge::dispatch
//!        │                          └── worker thread (Lua)
//!        └── RuntimeRecords: status, UI elements, log ring per script
//! ```

pub mod host;
pub mod manager;
pub mod pending;
pub mod protocol;
pub mod state;
pub mod ui;

pub use host::{ExecutionHost, LifecycleEvent, StopReport};
pub use manager::ScriptRuntimeManager;
pub use protocol::{HostMessage, LogLevel, RequestId, ScriptMessage, ScriptMetadata};
pub use state::{
    new_shared_records, LogSource, RuntimeRecords, ScriptLogEntry, ScriptRuntimeState,
    ScriptStatus, SharedRecords,
};
pub use ui::{ScriptUiElement, UiElementKind};
