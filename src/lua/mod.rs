//! Embedded Lua interpreter for user scripts.
//!
//! # Architecture
//!
//! ```text
//! ExecutionHost (runtime::host)
//!  └── worker thread (runtime.rs)
//!       ├── sandboxed Lua state (sandbox.rs)
//!       ├── primitives: log, json, host.request / host.on
//!       └── embedded prelude (host.http, host.ws, host.ui, ...)
//! ```
//!
//! One interpreter per running script; nothing here is shared between
//! scripts.

pub mod embedded;
pub mod primitives;
pub mod runtime;
pub mod sandbox;

pub use primitives::{EventCallbackId, EventCallbacks, SharedEventCallbacks};
pub use runtime::{spawn_worker, WorkerOptions};
pub use sandbox::{check_source, create_sandbox};
