//! Scriptbox CLI - manage and run sandboxed Lua automation scripts.
//!
//! This is the main binary entry point. See the `scriptbox` library for the
//! runtime itself.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use scriptbox::commands::{self, AddOptions, CheckOutcome, RunOptions};
use scriptbox::{Config, ScriptStore};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

// CLI
#[derive(Parser)]
#[command(name = "scriptbox")]
#[command(version)]
#[command(about = "Sandboxed Lua automation runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored scripts
    List,
    /// Store a Lua file as a new script
    Add {
        /// Path to the Lua source
        file: PathBuf,
        /// Display name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
        /// Unlock trust-gated actions (HTTP, WebSocket, invoke)
        #[arg(long)]
        trusted: bool,
        /// Capability to switch on (repeatable): invoke, http, websocket, window,
        /// modals, settings-read, settings-write, ui
        #[arg(long = "allow", value_name = "CAP")]
        allow: Vec<String>,
        /// Start with `scriptbox run`
        #[arg(long)]
        auto_start: bool,
        /// Store the script disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Delete a script
    Remove {
        /// Script id
        id: String,
    },
    /// Set the trust flag of a script
    Trust {
        /// Script id
        id: String,
        /// New trust flag
        #[arg(action = clap::ArgAction::Set)]
        trusted: bool,
    },
    /// Sanitize and compile a file, printing any diagnostic
    Check {
        /// Path to the Lua source
        file: PathBuf,
    },
    /// Run scripts headless until interrupted
    Run {
        /// Script ids (default: every enabled auto-start script)
        ids: Vec<String>,
        /// JSON file served as the window snapshot
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Ok(path) = std::env::var("SCRIPTBOX_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .map_err(|e| anyhow::anyhow!("Failed to create log file at {path}: {e}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    // Log panics before the default handler prints them
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::List => {
            let store = ScriptStore::open(config.scripts_path())?;
            commands::list(&store)?;
        }
        Commands::Add {
            file,
            name,
            trusted,
            allow,
            auto_start,
            disabled,
        } => {
            let store = ScriptStore::open(config.scripts_path())?;
            commands::add(
                &store,
                &file,
                AddOptions {
                    name,
                    trusted,
                    allow,
                    auto_start,
                    disabled,
                },
            )?;
        }
        Commands::Remove { id } => {
            let store = ScriptStore::open(config.scripts_path())?;
            commands::remove(&store, &id)?;
        }
        Commands::Trust { id, trusted } => {
            let store = ScriptStore::open(config.scripts_path())?;
            commands::trust(&store, &id, trusted)?;
        }
        Commands::Check { file } => {
            if let CheckOutcome::Failed(_) = commands::check(&file, config.compile_fallback)? {
                std::process::exit(1);
            }
        }
        Commands::Run { ids, snapshot } => {
            use signal_hook::consts::signal::{SIGINT, SIGTERM};
            use signal_hook::flag;
            flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
            flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;

            commands::run(config, RunOptions { ids, snapshot }, &SHUTDOWN_FLAG)?;
        }
    }

    Ok(())
}
