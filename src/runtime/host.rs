//! Execution Host: the host-side half of one running script.
//!
//! Owns the worker thread's channel pair, the pending-request arena and the
//! script's WebSocket connections. A pump task reads worker messages: bridge
//! requests are dispatched as independent tasks, log lines go to the
//! script's records, and exit messages become [`LifecycleEvent`]s for the
//! manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::pending::{PendingRequests, Responder};
use super::protocol::{HostMessage, RequestId, ScriptMessage, ScriptMetadata};
use super::state::LogSource;
use crate::bridge::{HostBridge, RequestContext, SharedConnections, WsConnections};
use crate::error::ScriptError;
use crate::lua::{spawn_worker, WorkerOptions};
use crate::script::{ManagedScript, ScriptPermissions};
use crate::security::security_signature;
use crate::ws::CLOSE_NORMAL;

/// Close reason sent to every socket when a host stops.
const STOP_CLOSE_REASON: &str = "script stopped";

/// A worker ended on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Main chunk returned with no handlers registered.
    Finished {
        /// Script id.
        script_id: String,
        /// Instance that finished.
        instance_id: u64,
    },
    /// Compile failure, uncaught error, or the worker vanished.
    Failed {
        /// Script id.
        script_id: String,
        /// Instance that failed.
        instance_id: u64,
        /// What went wrong.
        error: ScriptError,
    },
}

impl LifecycleEvent {
    /// Script the event belongs to.
    #[must_use]
    pub fn script_id(&self) -> &str {
        match self {
            Self::Finished { script_id, .. } | Self::Failed { script_id, .. } => script_id,
        }
    }

    /// Instance the event belongs to.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        match self {
            Self::Finished { instance_id, .. } | Self::Failed { instance_id, .. } => *instance_id,
        }
    }
}

/// What `stop` tore down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Requests rejected with `StoppedError`.
    pub rejected_requests: usize,
    /// Sockets asked to close.
    pub closed_connections: usize,
}

/// Host side of one running script instance.
pub struct ExecutionHost {
    script_id: String,
    instance_id: u64,
    signature: String,
    permissions: ScriptPermissions,
    to_script: mpsc::Sender<HostMessage>,
    pending: Arc<Mutex<PendingRequests>>,
    connections: SharedConnections,
    stop_flag: Arc<AtomicBool>,
    pump: JoinHandle<()>,
    worker: thread::JoinHandle<()>,
    stopped: bool,
}

impl std::fmt::Debug for ExecutionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHost")
            .field("script_id", &self.script_id)
            .field("instance_id", &self.instance_id)
            .field("signature", &self.signature)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

/// State shared by the pump and its dispatch tasks.
struct PumpContext {
    bridge: Arc<HostBridge>,
    request: Arc<RequestContext>,
    pending: Arc<Mutex<PendingRequests>>,
    stop_flag: Arc<AtomicBool>,
    lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
    instance_id: u64,
}

impl ExecutionHost {
    /// Spawn a worker for `script` and start it.
    ///
    /// `script.source` must already be sanitized. Must be called inside a
    /// tokio runtime.
    pub fn start(
        script: &ManagedScript,
        instance_id: u64,
        bridge: Arc<HostBridge>,
        lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .context("Execution hosts must be started inside a tokio runtime")?;
        let config = bridge.config();
        let capacity = config.channel_capacity.max(1);

        let (to_script, inbox) = mpsc::channel(capacity);
        let (outbox, from_script) = mpsc::channel(capacity);
        let stop_flag = Arc::new(AtomicBool::new(false));

        let options = WorkerOptions {
            script_id: script.id.clone(),
            memory_limit: config.memory_limit_bytes,
            compile_fallback: config.compile_fallback,
            log_backlog: config.max_log_entries,
        };
        let worker = spawn_worker(options, inbox, outbox, Arc::clone(&stop_flag))?;

        to_script
            .try_send(HostMessage::Start {
                code: script.source.clone(),
                metadata: ScriptMetadata::from(script),
            })
            .map_err(|e| anyhow!("Failed to start script worker: {e}"))?;

        let pending = Arc::new(Mutex::new(PendingRequests::new(config.max_pending_requests)));
        let connections = WsConnections::new_shared();
        let pump_ctx = PumpContext {
            request: Arc::new(RequestContext {
                script: script.clone(),
                to_script: to_script.clone(),
                connections: Arc::clone(&connections),
            }),
            bridge,
            pending: Arc::clone(&pending),
            stop_flag: Arc::clone(&stop_flag),
            lifecycle,
            instance_id,
        };
        let pump = handle.spawn(pump(pump_ctx, from_script));

        log::info!("[runtime] Started {} (instance {instance_id})", script.id);
        Ok(Self {
            script_id: script.id.clone(),
            instance_id,
            signature: security_signature(script),
            permissions: script.permissions,
            to_script,
            pending,
            connections,
            stop_flag,
            pump,
            worker,
            stopped: false,
        })
    }

    /// Script id.
    #[must_use]
    pub fn script_id(&self) -> &str {
        &self.script_id
    }

    /// Instance number assigned at start.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Security signature recorded at start.
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Capabilities the instance was started with.
    #[must_use]
    pub fn permissions(&self) -> ScriptPermissions {
        self.permissions
    }

    /// Requests currently awaiting a bridge result.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().expect("PendingRequests mutex poisoned").len()
    }

    /// Open (or opening) sockets.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connections.lock().expect("WsConnections mutex poisoned").len()
    }

    /// Whether the worker thread has exited.
    #[must_use]
    pub fn worker_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Queue an event for the script's handlers.
    ///
    /// Returns `false` when the host is stopped or the worker's queue is full.
    pub fn post_event(&self, event: &str, payload: Value) -> bool {
        if self.stopped {
            return false;
        }
        let msg = HostMessage::HostEvent {
            event: event.to_string(),
            payload,
        };
        match self.to_script.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[runtime] {}: dropped event {event}: {e}", self.script_id);
                false
            }
        }
    }

    /// Reject every pending request, close every socket and tear down the
    /// worker. Idempotent.
    pub fn stop(&mut self) -> StopReport {
        if self.stopped {
            return StopReport::default();
        }
        self.stopped = true;
        self.stop_flag.store(true, Ordering::SeqCst);
        self.pump.abort();

        let rejected_requests = self
            .pending
            .lock()
            .expect("PendingRequests mutex poisoned")
            .drain_stopped();
        let closed_connections = self
            .connections
            .lock()
            .expect("WsConnections mutex poisoned")
            .close_all(CLOSE_NORMAL, STOP_CLOSE_REASON)
            .len();
        // A full queue is fine: the stop flag ends the worker anyway.
        let _ = self.to_script.try_send(HostMessage::Stop);

        log::info!(
            "[runtime] Stopped {} (instance {}): {rejected_requests} request(s) rejected, {closed_connections} connection(s) closed",
            self.script_id,
            self.instance_id
        );
        StopReport {
            rejected_requests,
            closed_connections,
        }
    }
}

impl Drop for ExecutionHost {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump(ctx: PumpContext, mut from_script: mpsc::Receiver<ScriptMessage>) {
    let ctx = Arc::new(ctx);
    let script_id = ctx.request.script.id.clone();

    let exit = loop {
        let Some(msg) = from_script.recv().await else {
            break None;
        };
        if ctx.stop_flag.load(Ordering::SeqCst) {
            return;
        }
        match msg {
            ScriptMessage::HostRequest {
                request_id,
                action,
                payload,
            } => accept_request(&ctx, request_id, action, payload).await,
            ScriptMessage::HostLog { level, message } => {
                ctx.bridge
                    .records()
                    .lock()
                    .expect("RuntimeRecords mutex poisoned")
                    .append_log(&script_id, level, LogSource::Script, &message);
            }
            ScriptMessage::ScriptFinished => {
                break Some(LifecycleEvent::Finished {
                    script_id: script_id.clone(),
                    instance_id: ctx.instance_id,
                });
            }
            ScriptMessage::ScriptError { error } => {
                break Some(LifecycleEvent::Failed {
                    script_id: script_id.clone(),
                    instance_id: ctx.instance_id,
                    error,
                });
            }
        }
    };

    if ctx.stop_flag.load(Ordering::SeqCst) {
        return;
    }
    let event = exit.unwrap_or_else(|| LifecycleEvent::Failed {
        script_id: script_id.clone(),
        instance_id: ctx.instance_id,
        error: ScriptError::runtime("script worker exited unexpectedly"),
    });
    if ctx.lifecycle.send(event).is_err() {
        log::debug!("[runtime] {script_id}: lifecycle receiver gone");
    }
}

async fn accept_request(ctx: &Arc<PumpContext>, request_id: RequestId, action: String, payload: Value) {
    let responder = Responder::new(request_id, ctx.request.to_script.clone());
    let inserted = ctx
        .pending
        .lock()
        .expect("PendingRequests mutex poisoned")
        .insert(request_id, &action, responder);
    if let Err((responder, error)) = inserted {
        responder.resolve(Err(error)).await;
        return;
    }

    let task_ctx = Arc::clone(ctx);
    let task = tokio::spawn(async move {
        let outcome = task_ctx
            .bridge
            .dispatch(&task_ctx.request, &action, payload)
            .await;
        let responder = task_ctx
            .pending
            .lock()
            .expect("PendingRequests mutex poisoned")
            .take(request_id);
        // None: stop already answered this request.
        if let Some(responder) = responder {
            responder.resolve(outcome).await;
        }
    });
    ctx.pending
        .lock()
        .expect("PendingRequests mutex poisoned")
        .attach_task(request_id, task.abort_handle());
}
