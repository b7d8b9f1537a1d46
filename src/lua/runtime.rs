//! Script worker.
//!
//! Every running script owns one OS thread. The thread builds a
//! current-thread tokio runtime and a `LocalSet`, creates a sandboxed Lua
//! state, and then only talks to its Execution Host through the message
//! channel pair. The Lua state never leaves the thread.
//!
//! ```text
//! ExecutionHost ──HostMessage──▶ worker loop ──▶ host-response → waiting coroutine
//!                                   │          └▶ host-event    → handler queue
//!               ◀─ScriptMessage──  main chunk / handlers (host.request, log.*)
//! ```
//!
//! The worker reports exactly one terminal message: `script-finished` once
//! the main chunk has returned and no subscriptions are left (checked when
//! the chunk returns and after every dispatched event), or `script-error`
//! for a compile failure or an error escaping the main chunk or a handler.
//! Backlogged log lines are flushed before the terminal message. A worker
//! told to stop reports nothing.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use mlua::Lua;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use super::embedded;
use super::primitives::{
    self, json_to_lua, new_event_callbacks, HostLink, LogOutbox, SharedEventCallbacks,
};
use super::sandbox::{compile, create_sandbox, error_message};
use crate::error::ScriptError;
use crate::runtime::protocol::{HostMessage, LogLevel, ScriptMessage, ScriptMetadata};

/// Settings for one worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Script id, for thread names and diagnostics.
    pub script_id: String,
    /// Lua allocator limit in bytes (0 = unlimited).
    pub memory_limit: usize,
    /// Retry compilation without non-ASCII characters.
    pub compile_fallback: bool,
    /// Log lines kept while the host channel is full.
    pub log_backlog: usize,
}

/// How the script ended, when it ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Finished,
    Stopped,
}

/// Spawn the worker thread.
///
/// The worker waits for `start` on `inbox` before doing anything.
///
/// # Errors
///
/// Returns an error if the OS refuses to create the thread.
pub fn spawn_worker(
    options: WorkerOptions,
    inbox: mpsc::Receiver<HostMessage>,
    outbox: mpsc::Sender<ScriptMessage>,
    stop_flag: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    let name: String = format!("script-{}", options.script_id)
        .chars()
        .take(32)
        .collect();
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    log::error!("[runtime] {}: failed to build worker runtime: {e}", options.script_id);
                    let error = ScriptError::runtime(format!("worker runtime unavailable: {e}"));
                    let _ = outbox.try_send(ScriptMessage::ScriptError { error });
                    return;
                }
            };
            let local = LocalSet::new();
            local.block_on(&runtime, run(options, inbox, outbox, stop_flag));
        })
        .context("Failed to spawn script worker thread")
}

async fn run(
    options: WorkerOptions,
    mut inbox: mpsc::Receiver<HostMessage>,
    outbox: mpsc::Sender<ScriptMessage>,
    stop_flag: Arc<AtomicBool>,
) {
    let (code, metadata) = loop {
        match inbox.recv().await {
            Some(HostMessage::Start { code, metadata }) => break (code, metadata),
            Some(HostMessage::Stop) | None => return,
            Some(other) => {
                log::debug!("[runtime] {}: ignoring {other:?} before start", options.script_id);
            }
        }
    };

    let logs = LogOutbox::new(outbox.clone(), options.log_backlog);
    let outcome = execute(&options, &code, &metadata, &mut inbox, &logs, &stop_flag).await;
    if stop_flag.load(Ordering::Relaxed) {
        return;
    }
    let msg = match outcome {
        Ok(Exit::Stopped) => return,
        Ok(Exit::Finished) => ScriptMessage::ScriptFinished,
        Err(error) => ScriptMessage::ScriptError { error },
    };
    logs.flush().await;
    if outbox.send(msg).await.is_err() {
        log::debug!("[runtime] {}: host gone before exit report", options.script_id);
    }
}

async fn execute(
    options: &WorkerOptions,
    code: &str,
    metadata: &ScriptMetadata,
    inbox: &mut mpsc::Receiver<HostMessage>,
    logs: &Rc<LogOutbox>,
    stop_flag: &Arc<AtomicBool>,
) -> Result<Exit, ScriptError> {
    let setup_error = |e: anyhow::Error| ScriptError::runtime(format!("{e:#}"));

    let lua = create_sandbox(options.memory_limit, Some(Arc::clone(stop_flag))).map_err(setup_error)?;
    let link = HostLink::new(logs.sender(), Rc::clone(logs));
    let callbacks = new_event_callbacks();
    primitives::register_all(&lua, logs, &link, &callbacks, metadata).map_err(setup_error)?;
    let _flusher = DropAbort(tokio::task::spawn_local(Rc::clone(logs).run_flusher()));

    for (name, source) in embedded::all() {
        lua.load(*source)
            .set_name(*name)
            .exec()
            .map_err(|e| ScriptError::runtime(format!("{name}: {}", error_message(&e))))?;
    }

    let compiled = compile(&lua, code, options.compile_fallback)?;
    if compiled.stripped {
        logs.push(
            LogLevel::Warn,
            "script compiled only after removing non-ASCII characters".to_string(),
        );
    }

    let main = compiled.function;
    let mut main_task = tokio::task::spawn_local(async move { main.call_async::<()>(()).await });
    let main_done = Rc::new(Cell::new(false));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut event_task = tokio::task::spawn_local(dispatch_events(
        lua.clone(),
        Arc::clone(&callbacks),
        event_rx,
        Rc::clone(&main_done),
    ));

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            return Ok(Exit::Stopped);
        }
        tokio::select! {
            msg = inbox.recv() => match msg {
                Some(HostMessage::HostResponse { request_id, ok, result, error }) => {
                    let outcome = if ok {
                        Ok(result.unwrap_or(Value::Null))
                    } else {
                        Err(error.unwrap_or_else(|| ScriptError::runtime("request failed")))
                    };
                    if !link.resolve(request_id, outcome) {
                        log::debug!("[runtime] {}: no one waiting for response {request_id}", options.script_id);
                    }
                }
                Some(HostMessage::HostEvent { event, payload }) => {
                    // The handler task outlives this loop iteration; a send
                    // error means it already failed and will be reported below.
                    let _ = event_tx.send((event, payload));
                }
                Some(HostMessage::Start { .. }) => {
                    log::warn!("[runtime] {}: duplicate start ignored", options.script_id);
                }
                Some(HostMessage::Stop) | None => return Ok(Exit::Stopped),
            },
            result = &mut main_task, if !main_done.get() => {
                main_done.set(true);
                match result {
                    Ok(Ok(())) => {
                        let subscribed = callbacks
                            .lock()
                            .expect("Event callbacks mutex poisoned")
                            .callback_count();
                        if subscribed == 0 {
                            return Ok(Exit::Finished);
                        }
                        log::debug!(
                            "[runtime] {}: main chunk done, {subscribed} handler(s) keep it running",
                            options.script_id
                        );
                    }
                    Ok(Err(e)) => return Err(ScriptError::runtime(error_message(&e))),
                    Err(e) => return Err(ScriptError::runtime(format!("main chunk aborted: {e}"))),
                }
            }
            result = &mut event_task => {
                return match result {
                    // Only returns early once the last handler is gone.
                    Ok(Ok(())) => Ok(Exit::Finished),
                    Ok(Err(e)) => Err(ScriptError::runtime(error_message(&e))),
                    Err(e) => Err(ScriptError::runtime(format!("event handler aborted: {e}"))),
                };
            }
        }
    }
}

/// Aborts a local task when dropped.
struct DropAbort(tokio::task::JoinHandle<()>);

impl Drop for DropAbort {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run handlers for each queued event, one event at a time.
///
/// Returns `Ok(())` when the main chunk has finished and the last handler
/// has unsubscribed.
async fn dispatch_events(
    lua: Lua,
    callbacks: SharedEventCallbacks,
    mut events: mpsc::UnboundedReceiver<(String, Value)>,
    main_done: Rc<Cell<bool>>,
) -> mlua::Result<()> {
    while let Some((event, payload)) = events.recv().await {
        let handlers = callbacks
            .lock()
            .expect("Event callbacks mutex poisoned")
            .handlers(&lua, &event);
        if !handlers.is_empty() {
            let value = json_to_lua(&lua, &payload)?;
            for handler in handlers {
                handler
                    .call_async::<()>((value.clone(), event.as_str()))
                    .await?;
            }
        }
        let subscribed = callbacks
            .lock()
            .expect("Event callbacks mutex poisoned")
            .callback_count();
        if main_done.get() && subscribed == 0 {
            return Ok(());
        }
    }
    // The sender lives as long as the worker loop.
    std::future::pending().await
}
