//! Managed script records.
//!
//! A [`ManagedScript`] is the persisted unit of user automation: source text
//! plus the trust flag and capability toggles the permission gate consults.
//! Records are owned by the [`store::ScriptStore`]; everything else holds
//! clones.

pub mod store;

use serde::{Deserialize, Serialize};

pub use store::ScriptStore;

/// The only scripting language the runtime hosts.
pub const SCRIPT_LANGUAGE: &str = "lua";

/// Named, independently toggleable permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// Forward named commands to the surrounding application.
    Invoke,
    /// Outbound HTTP requests.
    Http,
    /// Outbound WebSocket connections.
    WebSocket,
    /// Read-only projections of application state.
    WindowRead,
    /// Blocking dialogs.
    Modals,
    /// Read the script's own settings namespace.
    SettingsRead,
    /// Write the script's own settings namespace.
    SettingsWrite,
    /// Declare UI elements.
    Ui,
}

impl Capability {
    /// Every capability, in signature bit order.
    pub const ALL: [Capability; 8] = [
        Capability::Invoke,
        Capability::Http,
        Capability::WebSocket,
        Capability::WindowRead,
        Capability::Modals,
        Capability::SettingsRead,
        Capability::SettingsWrite,
        Capability::Ui,
    ];

    /// Short name used in messages and on the command line.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Invoke => "invoke",
            Self::Http => "http",
            Self::WebSocket => "websocket",
            Self::WindowRead => "window",
            Self::Modals => "modals",
            Self::SettingsRead => "settings-read",
            Self::SettingsWrite => "settings-write",
            Self::Ui => "ui",
        }
    }

    /// Parse a short name produced by [`Capability::name`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// Capability toggles for one script.
///
/// Missing fields deserialize to the baseline: harmless capabilities on,
/// capabilities that reach outside the process off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptPermissions {
    /// Gate for `invoke`.
    pub allow_invoke: bool,
    /// Gate for `http.request`.
    pub allow_http: bool,
    /// Gate for `ws.*`.
    pub allow_web_socket: bool,
    /// Gate for `window.*`.
    pub allow_window_read: bool,
    /// Gate for `modal.*`.
    pub allow_modals: bool,
    /// Gate for `settings.get` / `settings.all`.
    pub allow_settings_read: bool,
    /// Gate for `settings.set`.
    pub allow_settings_write: bool,
    /// Gate for `ui.*`.
    pub allow_ui: bool,
}

impl Default for ScriptPermissions {
    fn default() -> Self {
        Self {
            allow_invoke: false,
            allow_http: false,
            allow_web_socket: false,
            allow_window_read: true,
            allow_modals: true,
            allow_settings_read: true,
            allow_settings_write: true,
            allow_ui: true,
        }
    }
}

impl ScriptPermissions {
    /// Everything switched off.
    #[must_use]
    pub fn none() -> Self {
        Self {
            allow_invoke: false,
            allow_http: false,
            allow_web_socket: false,
            allow_window_read: false,
            allow_modals: false,
            allow_settings_read: false,
            allow_settings_write: false,
            allow_ui: false,
        }
    }

    /// Everything switched on.
    #[must_use]
    pub fn all() -> Self {
        Self {
            allow_invoke: true,
            allow_http: true,
            allow_web_socket: true,
            allow_window_read: true,
            allow_modals: true,
            allow_settings_read: true,
            allow_settings_write: true,
            allow_ui: true,
        }
    }

    /// Whether `capability` is switched on.
    #[must_use]
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Invoke => self.allow_invoke,
            Capability::Http => self.allow_http,
            Capability::WebSocket => self.allow_web_socket,
            Capability::WindowRead => self.allow_window_read,
            Capability::Modals => self.allow_modals,
            Capability::SettingsRead => self.allow_settings_read,
            Capability::SettingsWrite => self.allow_settings_write,
            Capability::Ui => self.allow_ui,
        }
    }

    /// Toggle a single capability.
    pub fn set(&mut self, capability: Capability, enabled: bool) {
        let slot = match capability {
            Capability::Invoke => &mut self.allow_invoke,
            Capability::Http => &mut self.allow_http,
            Capability::WebSocket => &mut self.allow_web_socket,
            Capability::WindowRead => &mut self.allow_window_read,
            Capability::Modals => &mut self.allow_modals,
            Capability::SettingsRead => &mut self.allow_settings_read,
            Capability::SettingsWrite => &mut self.allow_settings_write,
            Capability::Ui => &mut self.allow_ui,
        };
        *slot = enabled;
    }

    /// Builder-style toggle.
    #[must_use]
    pub fn with(mut self, capability: Capability, enabled: bool) -> Self {
        self.set(capability, enabled);
        self
    }
}

/// A persisted script record. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedScript {
    /// Opaque, stable identifier (survives renames).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Language tag, always [`SCRIPT_LANGUAGE`].
    pub language: String,
    /// Source text as submitted (sanitized at start).
    pub source: String,
    /// Disabled scripts cannot start.
    pub enabled: bool,
    /// Unlocks trust-gated actions.
    pub trusted: bool,
    /// Start automatically when the runtime loads.
    pub auto_start: bool,
    /// Capability toggles.
    pub permissions: ScriptPermissions,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last modification time, epoch milliseconds.
    pub updated_at: i64,
}

/// Insert-or-update request for [`ScriptStore::save`].
///
/// Every field is optional; the store fills gaps from the existing record
/// (on update) or from safe defaults (on insert).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptDraft {
    /// Existing id to update, or `None` to insert.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Language tag (normalized to [`SCRIPT_LANGUAGE`]).
    pub language: Option<String>,
    /// Source text.
    pub source: Option<String>,
    /// Enabled flag.
    pub enabled: Option<bool>,
    /// Trust flag.
    pub trusted: Option<bool>,
    /// Auto-start flag.
    pub auto_start: Option<bool>,
    /// Capability toggles.
    pub permissions: Option<ScriptPermissions>,
}

impl From<&ManagedScript> for ScriptDraft {
    fn from(script: &ManagedScript) -> Self {
        Self {
            id: Some(script.id.clone()),
            name: Some(script.name.clone()),
            description: Some(script.description.clone()),
            language: Some(script.language.clone()),
            source: Some(script.source.clone()),
            enabled: Some(script.enabled),
            trusted: Some(script.trusted),
            auto_start: Some(script.auto_start),
            permissions: Some(script.permissions),
        }
    }
}
