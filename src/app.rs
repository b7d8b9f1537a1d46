//! Surrounding-application collaborator.
//!
//! Scripts never touch the application directly. The bridge forwards
//! `invoke`, window reads and modal dialogs to a [`HostApplication`], which an
//! embedder implements on top of its own UI. [`HeadlessApplication`] is the
//! implementation used by the `scriptbox` binary: modals go to the terminal
//! and the window snapshot comes from an optional JSON file.

use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Read-only projection of the application's state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WindowSnapshot {
    /// Account list as the application presents it.
    pub accounts: Vec<Value>,
    /// Currently selected account ids.
    pub selection: Vec<String>,
    /// Presence information keyed by account.
    pub presence: Value,
    /// Launch/session state.
    pub launch: Value,
    /// Application-level settings visible to scripts.
    pub settings: Value,
}

impl WindowSnapshot {
    /// Accounts whose id appears in `selection`.
    ///
    /// Accounts are matched on their `id` field (string or number).
    #[must_use]
    pub fn selected_accounts(&self) -> Vec<Value> {
        self.accounts
            .iter()
            .filter(|account| {
                let id = match account.get("id") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => return false,
                };
                self.selection.contains(&id)
            })
            .cloned()
            .collect()
    }
}

/// Operations the application exposes to scripts.
#[async_trait]
pub trait HostApplication: Send + Sync {
    /// Run a named application command.
    async fn invoke(&self, command: &str, args: Value) -> Result<Value>;

    /// Current window state.
    async fn snapshot(&self) -> Result<WindowSnapshot>;

    /// Informational dialog.
    async fn alert(&self, title: Option<&str>, message: &str) -> Result<()>;

    /// Yes/no dialog.
    async fn confirm(&self, title: Option<&str>, message: &str) -> Result<bool>;

    /// Text-entry dialog. `None` means the user cancelled.
    async fn prompt(
        &self,
        title: Option<&str>,
        message: &str,
        default: Option<&str>,
    ) -> Result<Option<String>>;

    /// Show structured data to the user.
    async fn show_json(&self, title: Option<&str>, value: &Value) -> Result<()>;
}

/// Terminal-backed application used by the CLI.
#[derive(Debug, Clone, Default)]
pub struct HeadlessApplication {
    snapshot_path: Option<PathBuf>,
    interactive: bool,
}

impl HeadlessApplication {
    /// Create a headless app. Modals only read stdin when it is a terminal.
    #[must_use]
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        Self {
            snapshot_path,
            interactive: std::io::stdin().is_terminal(),
        }
    }

    fn heading(title: Option<&str>) -> String {
        title.map(|t| format!("[{t}] ")).unwrap_or_default()
    }

    async fn read_line(question: String) -> Result<Option<String>> {
        tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let mut stderr = std::io::stderr();
            write!(stderr, "{question}")?;
            stderr.flush()?;
            let mut line = String::new();
            let read = std::io::stdin().lock().read_line(&mut line)?;
            if read == 0 {
                return Ok(None);
            }
            Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
        })
        .await
        .context("stdin reader task failed")?
    }
}

#[async_trait]
impl HostApplication for HeadlessApplication {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value> {
        match command {
            "echo" => Ok(args),
            "time.now" => Ok(Value::from(chrono::Utc::now().timestamp_millis())),
            other => anyhow::bail!("command '{other}' is not available in headless mode"),
        }
    }

    async fn snapshot(&self) -> Result<WindowSnapshot> {
        let Some(ref path) = self.snapshot_path else {
            return Ok(WindowSnapshot::default());
        };
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))
    }

    async fn alert(&self, title: Option<&str>, message: &str) -> Result<()> {
        eprintln!("{}{message}", Self::heading(title));
        Ok(())
    }

    async fn confirm(&self, title: Option<&str>, message: &str) -> Result<bool> {
        if !self.interactive {
            log::info!("[app] Non-interactive confirm declined: {message}");
            return Ok(false);
        }
        let answer = Self::read_line(format!("{}{message} [y/N] ", Self::heading(title))).await?;
        Ok(answer.is_some_and(|a| matches!(a.trim().to_ascii_lowercase().as_str(), "y" | "yes")))
    }

    async fn prompt(
        &self,
        title: Option<&str>,
        message: &str,
        default: Option<&str>,
    ) -> Result<Option<String>> {
        if !self.interactive {
            return Ok(default.map(str::to_string));
        }
        let hint = default.map(|d| format!(" [{d}]")).unwrap_or_default();
        let answer = Self::read_line(format!("{}{message}{hint}: ", Self::heading(title))).await?;
        Ok(match answer {
            Some(a) if a.is_empty() => default.map(str::to_string),
            other => other,
        })
    }

    async fn show_json(&self, title: Option<&str>, value: &Value) -> Result<()> {
        eprintln!(
            "{}{}",
            Self::heading(title),
            serde_json::to_string_pretty(value)?
        );
        Ok(())
    }
}
