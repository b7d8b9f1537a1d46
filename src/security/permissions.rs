//! Permission gate.
//!
//! Every bridge action is described by one row of [`ACTION_POLICIES`]: the
//! capability that must be switched on and whether the script must also be
//! trusted. [`authorize`] is the only place either check happens.

use crate::error::ScriptError;
use crate::script::{Capability, ManagedScript};

/// Every operation a script can ask the host to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeAction {
    /// `invoke`
    Invoke,
    /// `http.request`
    HttpRequest,
    /// `ws.connect`
    WsConnect,
    /// `ws.send`
    WsSend,
    /// `ws.close`
    WsClose,
    /// `ws.list`
    WsList,
    /// `window.snapshot`
    WindowSnapshot,
    /// `window.accounts`
    WindowAccounts,
    /// `window.selected`
    WindowSelected,
    /// `settings.get`
    SettingsGet,
    /// `settings.set`
    SettingsSet,
    /// `settings.all`
    SettingsAll,
    /// `modal.alert`
    ModalAlert,
    /// `modal.confirm`
    ModalConfirm,
    /// `modal.prompt`
    ModalPrompt,
    /// `modal.json`
    ModalJson,
    /// `ui.set`
    UiSet,
    /// `ui.patch`
    UiPatch,
    /// `ui.clear`
    UiClear,
}

/// One row of the action table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPolicy {
    /// Wire name used by scripts.
    pub name: &'static str,
    /// Parsed action.
    pub action: BridgeAction,
    /// Capability toggle consulted by the gate.
    pub capability: Capability,
    /// Whether the script must be trusted.
    pub requires_trust: bool,
}

const fn policy(
    name: &'static str,
    action: BridgeAction,
    capability: Capability,
    requires_trust: bool,
) -> ActionPolicy {
    ActionPolicy {
        name,
        action,
        capability,
        requires_trust,
    }
}

/// Fixed policy for every known action.
pub const ACTION_POLICIES: &[ActionPolicy] = &[
    policy("invoke", BridgeAction::Invoke, Capability::Invoke, true),
    policy("http.request", BridgeAction::HttpRequest, Capability::Http, true),
    policy("ws.connect", BridgeAction::WsConnect, Capability::WebSocket, true),
    policy("ws.send", BridgeAction::WsSend, Capability::WebSocket, true),
    policy("ws.close", BridgeAction::WsClose, Capability::WebSocket, true),
    policy("ws.list", BridgeAction::WsList, Capability::WebSocket, false),
    policy("window.snapshot", BridgeAction::WindowSnapshot, Capability::WindowRead, false),
    policy("window.accounts", BridgeAction::WindowAccounts, Capability::WindowRead, false),
    policy("window.selected", BridgeAction::WindowSelected, Capability::WindowRead, false),
    policy("settings.get", BridgeAction::SettingsGet, Capability::SettingsRead, false),
    policy("settings.set", BridgeAction::SettingsSet, Capability::SettingsWrite, true),
    policy("settings.all", BridgeAction::SettingsAll, Capability::SettingsRead, false),
    policy("modal.alert", BridgeAction::ModalAlert, Capability::Modals, false),
    policy("modal.confirm", BridgeAction::ModalConfirm, Capability::Modals, false),
    policy("modal.prompt", BridgeAction::ModalPrompt, Capability::Modals, false),
    policy("modal.json", BridgeAction::ModalJson, Capability::Modals, false),
    policy("ui.set", BridgeAction::UiSet, Capability::Ui, false),
    policy("ui.patch", BridgeAction::UiPatch, Capability::Ui, false),
    policy("ui.clear", BridgeAction::UiClear, Capability::Ui, false),
];

/// Look up the policy row for an action name.
#[must_use]
pub fn policy_for(name: &str) -> Option<&'static ActionPolicy> {
    ACTION_POLICIES.iter().find(|p| p.name == name)
}

/// Decide whether `script` may perform `action`.
///
/// The capability check runs first, so a disabled capability reports
/// `PermissionDenied` even for untrusted scripts.
pub fn authorize(
    script: &ManagedScript,
    capability: Capability,
    action: &str,
    trust_required: bool,
) -> Result<(), ScriptError> {
    if !script.permissions.allows(capability) {
        return Err(ScriptError::PermissionDenied {
            action: action.to_string(),
            capability,
        });
    }
    if trust_required && !script.trusted {
        return Err(ScriptError::TrustRequired {
            action: action.to_string(),
        });
    }
    Ok(())
}

/// Resolve and authorize an action name in one step.
pub fn authorize_action(
    script: &ManagedScript,
    action: &str,
) -> Result<&'static ActionPolicy, ScriptError> {
    let policy = policy_for(action).ok_or_else(|| ScriptError::UnknownAction {
        action: action.to_string(),
    })?;
    authorize(script, policy.capability, action, policy.requires_trust)?;
    Ok(policy)
}

/// Compact summary of trust + capability flags: `"<0|1>:<bitmask hex>"`.
///
/// Bit *n* is set when `Capability::ALL[n]` is enabled.
#[must_use]
pub fn security_signature(script: &ManagedScript) -> String {
    let mask = Capability::ALL
        .iter()
        .enumerate()
        .filter(|(_, cap)| script.permissions.allows(**cap))
        .fold(0u32, |acc, (bit, _)| acc | (1 << bit));
    format!("{}:{mask:02x}", u8::from(script.trusted))
}
