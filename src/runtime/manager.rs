//! Lifecycle controller.
//!
//! [`ScriptRuntimeManager`] is the only owner of [`ExecutionHost`]s, so "one
//! host per script id" is a property of a single `HashMap`. Hosts report
//! their own exits through a lifecycle channel that [`poll`] drains; every
//! other transition happens through a manager method.
//!
//! [`poll`]: ScriptRuntimeManager::poll

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::host::{ExecutionHost, LifecycleEvent, StopReport};
use super::protocol::LogLevel;
use super::state::{new_shared_records, LogSource, ScriptLogEntry, ScriptRuntimeState, ScriptStatus, SharedRecords};
use super::ui::apply_value_edit;
use crate::app::HostApplication;
use crate::bridge::HostBridge;
use crate::config::Config;
use crate::script::{Capability, ManagedScript, ScriptDraft, ScriptStore};
use crate::security::{sanitize_source, security_signature};
use crate::settings::SettingsStore;

/// Event sent to a script right after it starts and whenever the
/// application's state changes.
pub const WINDOW_UPDATED_EVENT: &str = "window.updated";

/// Event echoed to a script when the user edits one of its UI elements.
pub const UI_EVENT: &str = "ui.event";

/// Owns every running script.
pub struct ScriptRuntimeManager {
    store: Arc<ScriptStore>,
    bridge: Arc<HostBridge>,
    records: SharedRecords,
    hosts: HashMap<String, ExecutionHost>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
    lifecycle_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    next_instance: u64,
}

impl std::fmt::Debug for ScriptRuntimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntimeManager")
            .field("running", &self.running_ids())
            .field("next_instance", &self.next_instance)
            .finish_non_exhaustive()
    }
}

impl ScriptRuntimeManager {
    /// Create a manager with no running scripts.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP clients can't be built.
    pub fn new(
        config: Arc<Config>,
        store: Arc<ScriptStore>,
        app: Arc<dyn HostApplication>,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        let records = new_shared_records(config.max_log_entries, config.max_log_message_len);
        let bridge = Arc::new(HostBridge::new(config, app, settings, Arc::clone(&records))?);
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        Ok(Self {
            store,
            bridge,
            records,
            hosts: HashMap::new(),
            lifecycle_tx,
            lifecycle_rx,
            next_instance: 0,
        })
    }

    /// The script store this manager reads from.
    #[must_use]
    pub fn store(&self) -> &Arc<ScriptStore> {
        &self.store
    }

    /// Start `id`, stopping any instance that is already running.
    ///
    /// The new instance receives a `window.updated` event with the current
    /// snapshot before anything else (when it may read window state).
    ///
    /// # Errors
    ///
    /// Unknown or disabled scripts, or a worker that fails to spawn.
    pub async fn start(&mut self, id: &str) -> Result<()> {
        let mut script = self
            .store
            .get(id)?
            .ok_or_else(|| anyhow!("Script {id} not found"))?;
        if !script.enabled {
            bail!("Script '{}' is disabled", script.name);
        }

        self.stop_host(id, "restarting");
        script.source = sanitize_source(&script.source);
        self.next_instance += 1;
        let instance_id = self.next_instance;

        {
            let mut records = self.records.lock().expect("RuntimeRecords mutex poisoned");
            let state = records.state_mut(id);
            state.status = ScriptStatus::Running;
            state.started_at = Some(now_ms());
            state.stopped_at = None;
            state.last_error = None;
            state.ui.clear();
            state.instance_id = instance_id;
            records.append_log(id, LogLevel::Info, LogSource::Host, "started");
        }

        let host = match ExecutionHost::start(
            &script,
            instance_id,
            Arc::clone(&self.bridge),
            self.lifecycle_tx.clone(),
        ) {
            Ok(host) => host,
            Err(e) => {
                self.mark_error(id, &format!("{e:#}"));
                return Err(e);
            }
        };
        self.hosts.insert(id.to_string(), host);
        self.deliver_initial_snapshot(&script).await;
        Ok(())
    }

    async fn deliver_initial_snapshot(&self, script: &ManagedScript) {
        if !script.permissions.allows(Capability::WindowRead) {
            return;
        }
        let payload = match self.window_payload().await {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("[runtime] {}: no initial window snapshot: {e:#}", script.id);
                return;
            }
        };
        if let Some(host) = self.hosts.get(&script.id) {
            host.post_event(WINDOW_UPDATED_EVENT, payload);
        }
    }

    async fn window_payload(&self) -> Result<Value> {
        let snapshot = self.bridge.app().snapshot().await?;
        Ok(serde_json::to_value(snapshot)?)
    }

    /// Stop `id`. Returns `None` when it wasn't running.
    pub fn stop(&mut self, id: &str) -> Option<StopReport> {
        self.stop_host(id, "stopped by user")
    }

    /// Stop (if running) and start again.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub async fn restart(&mut self, id: &str) -> Result<()> {
        self.stop(id);
        self.start(id).await
    }

    fn stop_host(&mut self, id: &str, reason: &str) -> Option<StopReport> {
        let mut host = self.hosts.remove(id)?;
        let report = host.stop();
        let mut records = self.records.lock().expect("RuntimeRecords mutex poisoned");
        let state = records.state_mut(id);
        state.status = ScriptStatus::Stopped;
        state.stopped_at = Some(now_ms());
        records.append_log(
            id,
            LogLevel::Info,
            LogSource::Host,
            &format!(
                "{reason}: {} pending request(s) rejected, {} connection(s) closed",
                report.rejected_requests, report.closed_connections
            ),
        );
        Some(report)
    }

    fn mark_error(&mut self, id: &str, message: &str) {
        let mut records = self.records.lock().expect("RuntimeRecords mutex poisoned");
        let state = records.state_mut(id);
        state.status = ScriptStatus::Error;
        state.stopped_at = Some(now_ms());
        state.last_error = Some(message.to_string());
        records.append_log(id, LogLevel::Error, LogSource::Host, message);
    }

    /// Reconcile running hosts with the store.
    ///
    /// Deleted scripts are stopped and their records purged. Disabled
    /// scripts are stopped. Scripts whose trust or capabilities changed
    /// since they started are stopped; they must be started again to run
    /// under the new permissions.
    ///
    /// # Errors
    ///
    /// Returns an error if the store can't be read.
    pub fn refresh(&mut self) -> Result<()> {
        let scripts = self.store.list()?;
        let by_id: HashMap<&str, &ManagedScript> =
            scripts.iter().map(|s| (s.id.as_str(), s)).collect();

        for id in self.running_ids() {
            let reason = match by_id.get(id.as_str()) {
                None => Some("script deleted"),
                Some(script) if !script.enabled => Some("script disabled"),
                Some(script) => {
                    let changed = self
                        .hosts
                        .get(&id)
                        .is_some_and(|host| host.signature() != security_signature(script));
                    changed.then_some("permissions changed")
                }
            };
            if let Some(reason) = reason {
                log::info!("[runtime] Force-stopping {id}: {reason}");
                self.stop_host(&id, reason);
            }
        }

        let mut records = self.records.lock().expect("RuntimeRecords mutex poisoned");
        for id in records.known_ids() {
            if !by_id.contains_key(id.as_str()) {
                records.purge(&id);
            }
        }
        Ok(())
    }

    /// Start every enabled auto-start script that isn't running.
    ///
    /// Failures are logged and skipped. Returns the ids started.
    ///
    /// # Errors
    ///
    /// Returns an error if the store can't be read.
    pub async fn auto_start(&mut self) -> Result<Vec<String>> {
        let candidates: Vec<String> = self
            .store
            .list()?
            .into_iter()
            .filter(|s| s.enabled && s.auto_start && !self.hosts.contains_key(&s.id))
            .map(|s| s.id)
            .collect();

        let mut started = Vec::new();
        for id in candidates {
            match self.start(&id).await {
                Ok(()) => started.push(id),
                Err(e) => log::warn!("[runtime] Auto-start of {id} failed: {e:#}"),
            }
        }
        Ok(started)
    }

    /// Insert or update a script, then reconcile running hosts.
    ///
    /// # Errors
    ///
    /// Store validation or I/O failures.
    pub fn save_script(&mut self, draft: ScriptDraft) -> Result<ManagedScript> {
        let saved = self.store.save(draft)?;
        self.refresh()?;
        Ok(saved)
    }

    /// Delete a script, then reconcile (stopping it and purging records).
    ///
    /// # Errors
    ///
    /// Store I/O failures.
    pub fn delete_script(&mut self, id: &str) -> Result<bool> {
        let deleted = self.store.delete(id)?;
        self.refresh()?;
        Ok(deleted)
    }

    /// Re-read the application snapshot and send it to every running
    /// script that may read window state. Returns how many received it.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot can't be read.
    pub async fn notify_window_changed(&mut self) -> Result<usize> {
        let payload = self.window_payload().await?;
        let delivered = self
            .hosts
            .values()
            .filter(|host| host.permissions().allows(Capability::WindowRead))
            .filter(|host| host.post_event(WINDOW_UPDATED_EVENT, payload.clone()))
            .count();
        Ok(delivered)
    }

    /// Send an event to every running script. Returns how many received it.
    pub fn broadcast(&self, event: &str, payload: &Value) -> usize {
        self.hosts
            .values()
            .filter(|host| host.post_event(event, payload.clone()))
            .count()
    }

    /// Record a value edit on one of `id`'s UI elements and echo it to the
    /// script as `ui.event`.
    ///
    /// # Errors
    ///
    /// Returns an error when the element doesn't exist.
    pub fn ui_event(&mut self, id: &str, element_id: &str, value: Option<Value>) -> Result<()> {
        let found = {
            let mut records = self.records.lock().expect("RuntimeRecords mutex poisoned");
            apply_value_edit(&mut records.state_mut(id).ui, element_id, value.clone())
        };
        if !found {
            bail!("Script {id} has no UI element '{element_id}'");
        }
        if let Some(host) = self.hosts.get(id) {
            host.post_event(
                UI_EVENT,
                json!({ "id": element_id, "value": value.unwrap_or(Value::Null) }),
            );
        }
        Ok(())
    }

    /// Apply exit notifications from hosts. Returns the events applied.
    ///
    /// Notifications from instances that were already replaced or stopped
    /// are discarded.
    pub fn poll(&mut self) -> Vec<LifecycleEvent> {
        let mut applied = Vec::new();
        while let Ok(event) = self.lifecycle_rx.try_recv() {
            if self.apply(&event) {
                applied.push(event);
            }
        }
        applied
    }

    /// Wait up to `timeout` for the next exit notification and apply it.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Option<LifecycleEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.lifecycle_rx.recv())
                .await
                .ok()??;
            if self.apply(&event) {
                return Some(event);
            }
        }
    }

    fn apply(&mut self, event: &LifecycleEvent) -> bool {
        let id = event.script_id();
        let current = self
            .hosts
            .get(id)
            .is_some_and(|host| host.instance_id() == event.instance_id());
        if !current {
            log::debug!(
                "[runtime] Ignoring exit of stale instance {} of {id}",
                event.instance_id()
            );
            return false;
        }

        if let Some(mut host) = self.hosts.remove(id) {
            host.stop();
        }
        match event {
            LifecycleEvent::Finished { .. } => {
                let mut records = self.records.lock().expect("RuntimeRecords mutex poisoned");
                let state = records.state_mut(id);
                state.status = ScriptStatus::Stopped;
                state.stopped_at = Some(now_ms());
                records.append_log(id, LogLevel::Info, LogSource::Host, "finished");
            }
            LifecycleEvent::Failed { error, .. } => {
                self.mark_error(id, &error.to_string());
            }
        }
        true
    }

    /// Current state of `id` (idle when never started).
    #[must_use]
    pub fn runtime_state(&self, id: &str) -> ScriptRuntimeState {
        self.records
            .lock()
            .expect("RuntimeRecords mutex poisoned")
            .state(id)
    }

    /// Log entries of `id`, oldest first.
    #[must_use]
    pub fn logs(&self, id: &str) -> Vec<ScriptLogEntry> {
        self.records
            .lock()
            .expect("RuntimeRecords mutex poisoned")
            .logs(id)
    }

    /// Drop the log entries of `id`.
    pub fn clear_logs(&self, id: &str) {
        self.records
            .lock()
            .expect("RuntimeRecords mutex poisoned")
            .clear_logs(id);
    }

    /// Whether `id` has a live host.
    #[must_use]
    pub fn is_running(&self, id: &str) -> bool {
        self.hosts.contains_key(id)
    }

    /// Ids of running scripts, sorted.
    #[must_use]
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hosts.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Host of `id`, if running.
    #[must_use]
    pub fn host(&self, id: &str) -> Option<&ExecutionHost> {
        self.hosts.get(id)
    }

    /// Stop everything.
    pub fn shutdown(&mut self) {
        for id in self.running_ids() {
            self.stop_host(&id, "runtime shutting down");
        }
    }
}

impl Drop for ScriptRuntimeManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
