//! `scriptbox run`: headless supervisor.
//!
//! Starts the named scripts (or every auto-start script), prints their log
//! lines as they arrive, and stops everything on SIGINT/SIGTERM or once no
//! script is left running.
//!
//! Two files are watched while scripts run:
//!
//! - `scripts.json`: edits from another `scriptbox` invocation (e.g.
//!   `scriptbox trust <id> false`) are reloaded and reconciled, which
//!   force-stops scripts that were disabled, deleted or had their
//!   permissions changed.
//! - the window snapshot file, when given: edits are broadcast to the
//!   scripts as `window.updated`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::app::{HeadlessApplication, HostApplication};
use crate::config::Config;
use crate::file_watcher::FileWatcher;
use crate::runtime::{LifecycleEvent, LogSource, ScriptLogEntry, ScriptRuntimeManager};
use crate::script::ScriptStore;
use crate::settings::{JsonFileSettings, SettingsStore};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Script ids; empty means "every enabled auto-start script".
    pub ids: Vec<String>,
    /// JSON file served as the window snapshot.
    pub snapshot: Option<PathBuf>,
}

/// Runs scripts until `shutdown` is set or all of them have exited.
///
/// # Errors
///
/// Returns an error if the runtime, the store or the settings file can't be
/// opened, or a named script fails to start.
pub fn run(config: Config, options: RunOptions, shutdown: &Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("scriptbox-host")
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(supervise(config, options, shutdown))
}

async fn supervise(config: Config, options: RunOptions, shutdown: &Arc<AtomicBool>) -> Result<()> {
    let config = Arc::new(config);
    let store_path = config.scripts_path();
    let store = Arc::new(ScriptStore::open(&store_path)?);
    let settings: Arc<dyn SettingsStore> = Arc::new(JsonFileSettings::open(config.settings_path())?);
    let app: Arc<dyn HostApplication> = Arc::new(HeadlessApplication::new(options.snapshot.clone()));
    let mut manager = ScriptRuntimeManager::new(config, store, app, settings)?;

    let started = if options.ids.is_empty() {
        manager.auto_start().await?
    } else {
        for id in &options.ids {
            manager
                .start(id)
                .await
                .with_context(|| format!("Failed to start {id}"))?;
        }
        options.ids.clone()
    };
    if started.is_empty() {
        println!("Nothing to run.");
        return Ok(());
    }
    log::info!("[app] Running {} script(s)", started.len());

    let mut printer = LogPrinter::default();
    let inputs = match WatchedInputs::open(&store_path, options.snapshot.as_deref()) {
        Ok(inputs) => Some(inputs),
        Err(e) => {
            log::warn!("[app] File watching unavailable, edits won't be picked up: {e:#}");
            None
        }
    };

    while !shutdown.load(Ordering::Relaxed) {
        for event in manager.poll() {
            match event {
                LifecycleEvent::Finished { script_id, .. } => println!("{script_id}: finished"),
                LifecycleEvent::Failed { script_id, error, .. } => {
                    println!("{script_id}: failed: {error}");
                }
            }
        }
        if let Some(inputs) = &inputs {
            inputs.apply(&mut manager).await;
        }
        printer.print_new(&manager, &started);

        if manager.running_ids().is_empty() {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    if !manager.running_ids().is_empty() {
        println!("Shutting down...");
    }
    manager.shutdown();
    printer.print_new(&manager, &started);
    Ok(())
}

/// Files whose edits the supervisor reacts to.
#[derive(Debug)]
struct WatchedInputs {
    watcher: FileWatcher,
    store: PathBuf,
    snapshot: Option<PathBuf>,
}

impl WatchedInputs {
    fn open(store: &Path, snapshot: Option<&Path>) -> Result<Self> {
        let mut watcher = FileWatcher::new()?;
        let store = watcher.watch_file(store)?;
        let snapshot = snapshot.map(|p| watcher.watch_file(p)).transpose()?;
        Ok(Self {
            watcher,
            store,
            snapshot,
        })
    }

    /// Apply the edits made since the last call.
    async fn apply(&self, manager: &mut ScriptRuntimeManager) {
        let changed = self.watcher.poll();
        if changed.contains(&self.store) {
            reload_store(manager);
        }
        if self.snapshot.as_ref().is_some_and(|p| changed.contains(p)) {
            match manager.notify_window_changed().await {
                Ok(delivered) => log::info!("[app] Window snapshot changed, sent to {delivered} script(s)"),
                Err(e) => log::warn!("[app] Window snapshot unreadable: {e:#}"),
            }
        }
    }
}

/// Re-read the store and reconcile running scripts with it.
fn reload_store(manager: &mut ScriptRuntimeManager) {
    let reloaded = manager.store().reload();
    match reloaded {
        Ok(false) => {}
        Ok(true) => {
            log::info!("[app] Script store changed on disk");
            if let Err(e) = manager.refresh() {
                log::warn!("[app] Failed to reconcile scripts: {e:#}");
            }
        }
        Err(e) => log::warn!("[app] Keeping previous scripts, store unreadable: {e:#}"),
    }
}

/// Prints each log entry once.
#[derive(Debug, Default)]
struct LogPrinter {
    last_seen: HashMap<String, u64>,
}

impl LogPrinter {
    fn print_new(&mut self, manager: &ScriptRuntimeManager, ids: &[String]) {
        for id in ids {
            let last = self.last_seen.get(id).copied().unwrap_or(0);
            let fresh: Vec<ScriptLogEntry> = manager
                .logs(id)
                .into_iter()
                .filter(|entry| entry.id > last)
                .collect();
            if let Some(newest) = fresh.last() {
                self.last_seen.insert(id.clone(), newest.id);
            }
            for entry in fresh {
                println!("{}", format_entry(id, &entry));
            }
        }
    }
}

fn format_entry(id: &str, entry: &ScriptLogEntry) -> String {
    let source = match entry.source {
        LogSource::Script => "",
        LogSource::Host => " (host)",
    };
    format!(
        "[{id}]{source} {:<5} {}",
        entry.level.as_log_level(),
        entry.message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LogLevel;
    use crate::script::ScriptDraft;
    use crate::settings::MemorySettings;
    use tempfile::TempDir;

    #[test]
    fn test_format_entry_marks_host_lines() {
        let entry = ScriptLogEntry {
            id: 1,
            timestamp: 0,
            level: LogLevel::Warn,
            source: LogSource::Host,
            message: "permissions changed".to_string(),
        };
        assert_eq!(format_entry("abc", &entry), "[abc] (host) WARN  permissions changed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_external_trust_change_stops_running_script() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("scripts.json");
        let store = Arc::new(ScriptStore::open(&path).expect("open"));
        let script = store
            .save(ScriptDraft {
                source: Some(r#"host.on("noop", function() end)"#.to_string()),
                trusted: Some(true),
                ..ScriptDraft::default()
            })
            .expect("save");

        let mut manager = ScriptRuntimeManager::new(
            Arc::new(Config::default()),
            Arc::clone(&store),
            Arc::new(HeadlessApplication::new(None)),
            Arc::new(MemorySettings::new()),
        )
        .expect("manager");
        manager.start(&script.id).await.expect("start");
        let inputs = WatchedInputs::open(&path, None).expect("watch");

        // A second invocation edits the same file.
        let other = ScriptStore::open(&path).expect("second handle");
        crate::commands::trust(&other, &script.id, false).expect("untrust");

        for _ in 0..250 {
            inputs.apply(&mut manager).await;
            if !manager.is_running(&script.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!manager.is_running(&script.id));
        assert!(!store.get(&script.id).expect("get").expect("present").trusted);
        let logged = manager
            .logs(&script.id)
            .iter()
            .any(|e| e.source == LogSource::Host && e.message.contains("permissions changed"));
        assert!(logged, "{:?}", manager.logs(&script.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreadable_store_keeps_scripts_running() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("scripts.json");
        let store = Arc::new(ScriptStore::open(&path).expect("open"));
        let script = store
            .save(ScriptDraft {
                source: Some(r#"host.on("noop", function() end)"#.to_string()),
                ..ScriptDraft::default()
            })
            .expect("save");
        let mut manager = ScriptRuntimeManager::new(
            Arc::new(Config::default()),
            Arc::clone(&store),
            Arc::new(HeadlessApplication::new(None)),
            Arc::new(MemorySettings::new()),
        )
        .expect("manager");
        manager.start(&script.id).await.expect("start");

        std::fs::write(&path, "{ truncated").expect("corrupt");
        reload_store(&mut manager);
        assert!(manager.is_running(&script.id));
        manager.shutdown();
    }
}
