//! `settings.*`: per-script key/value namespace.
//!
//! Every script gets its own section in the [`SettingsStore`], named from a
//! SHA-256 of the script id, so two scripts can never address each other's
//! keys no matter what the ids look like.

use data_encoding::HEXLOWER;
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{check_len, parse_payload};
use crate::error::ScriptError;
use crate::script::ManagedScript;
use crate::settings::SettingsStore;

/// Maximum key length in characters.
pub const MAX_SETTINGS_KEY_LEN: usize = 128;
/// Maximum value size in bytes.
pub const MAX_SETTINGS_VALUE_BYTES: usize = 16 * 1024;

/// Prefix shared by every script section.
const SECTION_PREFIX: &str = "script:";

/// Section name for a script id.
#[must_use]
pub fn section_for(script_id: &str) -> String {
    let digest = Sha256::digest(script_id.as_bytes());
    let hex = HEXLOWER.encode(&digest);
    format!("{SECTION_PREFIX}{}", &hex[..32])
}

#[derive(Debug, Deserialize)]
struct GetPayload {
    key: String,
}

#[derive(Debug, Deserialize)]
struct SetPayload {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

fn check_key(key: &str) -> Result<(), ScriptError> {
    if key.is_empty() {
        return Err(ScriptError::validation("settings key must not be empty"));
    }
    check_len("settings key", key, MAX_SETTINGS_KEY_LEN)
}

fn store_error(op: &str, e: &anyhow::Error) -> ScriptError {
    ScriptError::runtime(format!("settings {op} failed: {e:#}"))
}

pub(crate) fn get(
    store: &dyn SettingsStore,
    script: &ManagedScript,
    payload: Value,
) -> Result<Value, ScriptError> {
    let payload: GetPayload = parse_payload("settings.get", payload)?;
    check_key(&payload.key)?;
    let value = store
        .get(&section_for(&script.id), &payload.key)
        .map_err(|e| store_error("read", &e))?;
    Ok(value.map_or(Value::Null, Value::String))
}

pub(crate) fn set(
    store: &dyn SettingsStore,
    script: &ManagedScript,
    payload: Value,
) -> Result<Value, ScriptError> {
    let payload: SetPayload = parse_payload("settings.set", payload)?;
    check_key(&payload.key)?;
    if let Some(ref value) = payload.value {
        if value.len() > MAX_SETTINGS_VALUE_BYTES {
            return Err(ScriptError::validation(format!(
                "settings value exceeds {MAX_SETTINGS_VALUE_BYTES} bytes"
            )));
        }
    }
    store
        .set(
            &section_for(&script.id),
            &payload.key,
            payload.value.as_deref(),
        )
        .map_err(|e| store_error("write", &e))?;
    Ok(Value::Bool(true))
}

pub(crate) fn all(store: &dyn SettingsStore, script: &ManagedScript) -> Result<Value, ScriptError> {
    let mut sections = store.get_all().map_err(|e| store_error("read", &e))?;
    let entries = sections.remove(&section_for(&script.id)).unwrap_or_default();
    Ok(Value::Object(
        entries
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect::<Map<String, Value>>(),
    ))
}
