//! CLI subcommand implementations for scriptbox.
//!
//! Commands are organized into submodules by domain:
//!
//! - [`scripts`] - Script store management (list, add, remove, trust)
//! - [`check`] - Compile a file without running it
//! - [`run`] - Headless supervisor
//!
//! # Usage
//!
//! Commands are invoked from the main CLI dispatcher:
//!
//! ```ignore
//! use scriptbox::commands;
//!
//! commands::scripts::list(&store)?;
//! commands::check::check(&path, true)?;
//! ```

pub mod check;
pub mod run;
pub mod scripts;

// Re-export commonly used functions for convenience
#[doc(inline)]
pub use check::{check, CheckOutcome};
#[doc(inline)]
pub use run::{run, RunOptions};
#[doc(inline)]
pub use scripts::{add, list, remove, trust, AddOptions};
