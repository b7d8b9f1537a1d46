//! Logging primitive for scripts.
//!
//! Exposes a `log` table with one function per level. Calls don't write to
//! the process log directly: they are forwarded to the host as `host-log`
//! messages, which append them to the script's log ring and mirror them to
//! the `log` facade under the `script` target.
//!
//! # Usage in Lua
//!
//! ```lua
//! log.info("started")
//! log.warn("retrying", attempt)   -- extra arguments are joined with spaces
//! print("same as log.info")
//! ```
//!
//! Forwarding never blocks the script. When the channel to the host is full,
//! lines wait in a backlog that [`LogOutbox::flush`] drains. The backlog is
//! as large as the host's log ring and evicts its oldest line when full, so
//! a burst keeps the same lines the ring would.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use mlua::{Lua, MultiValue};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::runtime::protocol::{LogLevel, ScriptMessage};

/// Worker-side sender for `host-log` messages.
///
/// Lives on the worker thread only.
#[derive(Debug)]
pub struct LogOutbox {
    outbox: mpsc::Sender<ScriptMessage>,
    backlog: RefCell<VecDeque<ScriptMessage>>,
    backlog_limit: usize,
    evicted: Cell<u64>,
    wake: Notify,
}

impl LogOutbox {
    /// Outbox keeping at most `backlog_limit` lines while `outbox` is full.
    #[must_use]
    pub fn new(outbox: mpsc::Sender<ScriptMessage>, backlog_limit: usize) -> Rc<Self> {
        Rc::new(Self {
            outbox,
            backlog: RefCell::new(VecDeque::new()),
            backlog_limit: backlog_limit.max(1),
            evicted: Cell::new(0),
            wake: Notify::new(),
        })
    }

    /// Queue one line without waiting.
    pub fn push(&self, level: LogLevel, message: String) {
        let msg = ScriptMessage::HostLog { level, message };
        let mut backlog = self.backlog.borrow_mut();
        let msg = if backlog.is_empty() {
            match self.outbox.try_send(msg) {
                Ok(()) => return,
                Err(TrySendError::Closed(_)) => {
                    log::debug!("[runtime] Dropped script log line: host channel closed");
                    return;
                }
                Err(TrySendError::Full(msg)) => msg,
            }
        } else {
            msg
        };
        backlog.push_back(msg);
        while backlog.len() > self.backlog_limit {
            backlog.pop_front();
            self.evicted.set(self.evicted.get() + 1);
        }
        drop(backlog);
        self.wake.notify_one();
    }

    /// Channel the lines go out on.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<ScriptMessage> {
        self.outbox.clone()
    }

    /// Lines waiting for channel capacity.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.borrow().len()
    }

    /// Send every backlogged line, waiting for channel capacity.
    pub async fn flush(&self) {
        loop {
            if self.backlog.borrow().is_empty() {
                break;
            }
            let Ok(permit) = self.outbox.reserve().await else {
                self.backlog.borrow_mut().clear();
                break;
            };
            // Pop only once the slot is ours so lines keep their order.
            match self.backlog.borrow_mut().pop_front() {
                Some(msg) => permit.send(msg),
                None => break,
            }
        }
        let evicted = self.evicted.replace(0);
        if evicted > 0 {
            log::debug!("[runtime] Evicted {evicted} script log line(s) from a full backlog");
        }
    }

    /// Flush whenever lines are backlogged. Runs until the task is dropped.
    pub async fn run_flusher(self: Rc<Self>) {
        loop {
            self.wake.notified().await;
            self.flush().await;
        }
    }
}

/// Render the arguments of a log call the way `print` would.
fn render(args: &MultiValue) -> String {
    args.iter()
        .map(|value| match value.to_string() {
            Ok(s) => s,
            Err(_) => format!("<{}>", value.type_name()),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Register the `log` table and replace `print`.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(lua: &Lua, logs: &Rc<LogOutbox>) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    for (name, level) in [
        ("debug", LogLevel::Debug),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
    ] {
        let logs = Rc::clone(logs);
        let func = lua
            .create_function(move |_, args: MultiValue| {
                logs.push(level, render(&args));
                Ok(())
            })
            .map_err(|e| anyhow!("Failed to create log.{name} function: {e}"))?;
        log_table
            .set(name, func)
            .map_err(|e| anyhow!("Failed to set log.{name}: {e}"))?;
    }

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("Failed to register log table globally: {e}"))?;

    // print() goes to the same place as log.info().
    let logs = Rc::clone(logs);
    let print_fn = lua
        .create_function(move |_, args: MultiValue| {
            logs.push(LogLevel::Info, render(&args));
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create print function: {e}"))?;
    lua.globals()
        .set("print", print_fn)
        .map_err(|e| anyhow!("Failed to replace print: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(rx: &mut mpsc::Receiver<ScriptMessage>) -> Vec<(LogLevel, String)> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ScriptMessage::HostLog { level, message } = msg {
                out.push((level, message));
            }
        }
        out
    }

    fn setup(capacity: usize, backlog: usize) -> (Lua, Rc<LogOutbox>, mpsc::Receiver<ScriptMessage>) {
        let lua = Lua::new();
        let (tx, rx) = mpsc::channel(capacity);
        let logs = LogOutbox::new(tx, backlog);
        register(&lua, &logs).expect("Should register log primitives");
        (lua, logs, rx)
    }

    #[test]
    fn test_log_levels_forwarded() {
        let (lua, _logs, mut rx) = setup(16, 16);

        lua.load(
            r#"
            log.debug("d")
            log.info("i", 2, true)
            log.warn("w")
            log.error("e")
        "#,
        )
        .exec()
        .expect("log calls should succeed");

        assert_eq!(
            lines(&mut rx),
            vec![
                (LogLevel::Debug, "d".to_string()),
                (LogLevel::Info, "i 2 true".to_string()),
                (LogLevel::Warn, "w".to_string()),
                (LogLevel::Error, "e".to_string()),
            ]
        );
    }

    #[test]
    fn test_print_is_info() {
        let (lua, _logs, mut rx) = setup(4, 4);

        lua.load(r#"print("hello", nil)"#).exec().expect("print");
        assert_eq!(lines(&mut rx), vec![(LogLevel::Info, "hello nil".to_string())]);
    }

    #[tokio::test]
    async fn test_full_channel_keeps_newest_lines() {
        let (lua, logs, mut rx) = setup(2, 3);

        lua.load(r#"for i = 1, 10 do log.info("line " .. i) end"#)
            .exec()
            .expect("backlogged lines are not errors");
        assert_eq!(logs.backlog_len(), 3);

        let receive = async {
            let mut out = Vec::new();
            while out.len() < 5 {
                if let Some(ScriptMessage::HostLog { message, .. }) = rx.recv().await {
                    out.push(message);
                }
            }
            out
        };
        let ((), received) = tokio::join!(logs.flush(), receive);
        assert_eq!(
            received,
            vec!["line 1", "line 2", "line 8", "line 9", "line 10"]
        );
        assert_eq!(logs.backlog_len(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_drops_lines() {
        let (lua, logs, rx) = setup(1, 4);
        drop(rx);
        lua.load(r#"log.info("nobody listening")"#).exec().expect("log");
        assert_eq!(logs.backlog_len(), 0);
        logs.flush().await;
    }
}
