//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use scriptbox::runtime::ScriptLogEntry;
use scriptbox::{
    Config, HostApplication, ManagedScript, MemorySettings, ScriptDraft, ScriptPermissions,
    ScriptRuntimeManager, ScriptStore, SettingsStore, WindowSnapshot,
};
use serde_json::{json, Value};

/// Scriptable stand-in for the surrounding application.
#[derive(Debug, Default)]
pub struct FakeApp {
    pub snapshot: Mutex<WindowSnapshot>,
    pub invoked: Mutex<Vec<(String, Value)>>,
    pub alerts: Mutex<Vec<String>>,
    /// `confirm` never returns when set.
    pub hang_confirm: bool,
}

impl FakeApp {
    pub fn with_accounts(accounts: Vec<Value>) -> Self {
        Self {
            snapshot: Mutex::new(WindowSnapshot {
                accounts,
                ..WindowSnapshot::default()
            }),
            ..Self::default()
        }
    }
}

#[async_trait]
impl HostApplication for FakeApp {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value> {
        self.invoked
            .lock()
            .expect("invoked mutex poisoned")
            .push((command.to_string(), args.clone()));
        Ok(json!({ "command": command, "args": args }))
    }

    async fn snapshot(&self) -> Result<WindowSnapshot> {
        Ok(self.snapshot.lock().expect("snapshot mutex poisoned").clone())
    }

    async fn alert(&self, _title: Option<&str>, message: &str) -> Result<()> {
        self.alerts
            .lock()
            .expect("alerts mutex poisoned")
            .push(message.to_string());
        Ok(())
    }

    async fn confirm(&self, _title: Option<&str>, _message: &str) -> Result<bool> {
        if self.hang_confirm {
            std::future::pending::<()>().await;
        }
        Ok(true)
    }

    async fn prompt(
        &self,
        _title: Option<&str>,
        _message: &str,
        default: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(default.map(str::to_string))
    }

    async fn show_json(&self, _title: Option<&str>, _value: &Value) -> Result<()> {
        Ok(())
    }
}

/// Manager wired to in-memory collaborators.
pub struct Fixture {
    pub manager: ScriptRuntimeManager,
    pub store: Arc<ScriptStore>,
    pub app: Arc<FakeApp>,
    pub settings: Arc<MemorySettings>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_app(FakeApp::default())
    }

    pub fn with_app(app: FakeApp) -> Self {
        let config = Config {
            memory_limit_bytes: 32 * 1024 * 1024,
            ..Config::default()
        };
        let store = Arc::new(ScriptStore::in_memory());
        let app = Arc::new(app);
        let settings = Arc::new(MemorySettings::new());
        let manager = ScriptRuntimeManager::new(
            Arc::new(config),
            Arc::clone(&store),
            Arc::clone(&app) as Arc<dyn HostApplication>,
            Arc::clone(&settings) as Arc<dyn SettingsStore>,
        )
        .expect("manager");
        Self {
            manager,
            store,
            app,
            settings,
        }
    }

    /// Store a script with the given source and permissions.
    pub fn add(&mut self, source: &str, trusted: bool, permissions: ScriptPermissions) -> ManagedScript {
        self.manager
            .save_script(ScriptDraft {
                name: Some("test".to_string()),
                source: Some(source.to_string()),
                trusted: Some(trusted),
                permissions: Some(permissions),
                ..ScriptDraft::default()
            })
            .expect("save script")
    }

    /// Messages of `id`'s script-originated log entries.
    pub fn script_lines(&self, id: &str) -> Vec<String> {
        self.manager
            .logs(id)
            .into_iter()
            .filter(|e| e.source == scriptbox::runtime::LogSource::Script)
            .map(|e| e.message)
            .collect()
    }

    pub fn logs(&self, id: &str) -> Vec<ScriptLogEntry> {
        self.manager.logs(id)
    }

    /// Wait until `id` has logged `line` from script code.
    pub async fn wait_for_line(&self, id: &str, line: &str) {
        let found = wait_until(Duration::from_secs(5), || {
            self.script_lines(id).iter().any(|l| l == line)
        })
        .await;
        assert!(
            found,
            "timed out waiting for {line:?}; got {:?}",
            self.script_lines(id)
        );
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
