//! Pending host-request arena.
//!
//! Each in-flight bridge request owns a [`Responder`]. Resolving consumes
//! it, so a request can be answered at most once; whoever removes the
//! entry from [`PendingRequests`] first (the dispatch task or `stop`) is
//! the one that answers.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::protocol::{HostMessage, RequestId};
use crate::error::ScriptError;

/// One-shot answer channel for a single request.
#[derive(Debug)]
pub struct Responder {
    request_id: RequestId,
    to_script: mpsc::Sender<HostMessage>,
}

impl Responder {
    /// Bind a responder to the worker channel.
    #[must_use]
    pub fn new(request_id: RequestId, to_script: mpsc::Sender<HostMessage>) -> Self {
        Self {
            request_id,
            to_script,
        }
    }

    /// Deliver the outcome. Waits for channel capacity.
    pub async fn resolve(self, outcome: Result<Value, ScriptError>) {
        let msg = HostMessage::response(self.request_id, outcome);
        if self.to_script.send(msg).await.is_err() {
            log::debug!(
                "[runtime] Dropped response {}: worker gone",
                self.request_id
            );
        }
    }

    /// Reject with [`ScriptError::Stopped`] without waiting.
    pub fn reject_stopped(self) {
        let msg = HostMessage::response(self.request_id, Err(ScriptError::Stopped));
        // The worker is being torn down; a full or closed channel is fine.
        let _ = self.to_script.try_send(msg);
    }
}

/// An in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    /// Action name, for diagnostics.
    pub action: String,
    /// When the request was accepted.
    pub issued_at: Instant,
    responder: Responder,
    task: Option<AbortHandle>,
}

/// `requestId -> PendingRequest`.
#[derive(Debug)]
pub struct PendingRequests {
    entries: HashMap<RequestId, PendingRequest>,
    capacity: usize,
}

impl PendingRequests {
    /// Empty arena accepting at most `capacity` concurrent requests.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register a request. Fails on duplicate ids or when full.
    ///
    /// On failure the responder is handed back so the caller can reject it.
    pub fn insert(
        &mut self,
        request_id: RequestId,
        action: &str,
        responder: Responder,
    ) -> Result<(), (Responder, ScriptError)> {
        if self.entries.contains_key(&request_id) {
            return Err((
                responder,
                ScriptError::validation(format!("duplicate request id {request_id}")),
            ));
        }
        if self.entries.len() >= self.capacity {
            return Err((
                responder,
                ScriptError::validation(format!(
                    "too many pending requests (limit: {})",
                    self.capacity
                )),
            ));
        }
        self.entries.insert(
            request_id,
            PendingRequest {
                action: action.to_string(),
                issued_at: Instant::now(),
                responder,
                task: None,
            },
        );
        Ok(())
    }

    /// Remember the dispatch task so `drain_stopped` can abort it.
    ///
    /// No-op when the request already completed.
    pub fn attach_task(&mut self, request_id: RequestId, task: AbortHandle) {
        if let Some(entry) = self.entries.get_mut(&request_id) {
            entry.task = Some(task);
        }
    }

    /// Remove a request, handing its responder to the caller.
    pub fn take(&mut self, request_id: RequestId) -> Option<Responder> {
        self.entries.remove(&request_id).map(|entry| entry.responder)
    }

    /// Abort every dispatch task and reject every request with `Stopped`.
    ///
    /// Returns how many requests were rejected.
    pub fn drain_stopped(&mut self) -> usize {
        let count = self.entries.len();
        for (request_id, entry) in self.entries.drain() {
            if let Some(task) = entry.task {
                task.abort();
            }
            log::debug!(
                "[runtime] Rejecting {} request {request_id} after {:?}",
                entry.action,
                entry.issued_at.elapsed()
            );
            entry.responder.reject_stopped();
        }
        count
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
