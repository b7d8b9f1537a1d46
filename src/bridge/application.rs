//! `invoke` and `window.*`: forwarding to the surrounding application.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_payload, HostBridge};
use crate::error::ScriptError;

/// Maximum command name length.
const MAX_COMMAND_LEN: usize = 128;

#[derive(Debug, Deserialize)]
struct InvokePayload {
    command: String,
    #[serde(default)]
    args: Value,
}

fn validate_command(command: &str) -> Result<(), ScriptError> {
    if command.is_empty() {
        return Err(ScriptError::validation("invoke: command must not be empty"));
    }
    if command.len() > MAX_COMMAND_LEN {
        return Err(ScriptError::validation(format!(
            "invoke: command exceeds {MAX_COMMAND_LEN} characters"
        )));
    }
    if !command
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
    {
        return Err(ScriptError::validation(format!(
            "invoke: invalid command name '{command}'"
        )));
    }
    Ok(())
}

pub(crate) async fn invoke(bridge: &HostBridge, payload: Value) -> Result<Value, ScriptError> {
    let payload: InvokePayload = parse_payload("invoke", payload)?;
    validate_command(&payload.command)?;
    bridge
        .app()
        .invoke(&payload.command, payload.args)
        .await
        .map_err(|e| ScriptError::runtime(format!("{}: {e:#}", payload.command)))
}

async fn load_snapshot(bridge: &HostBridge) -> Result<crate::app::WindowSnapshot, ScriptError> {
    bridge
        .app()
        .snapshot()
        .await
        .map_err(|e| ScriptError::runtime(format!("window snapshot unavailable: {e:#}")))
}

pub(crate) async fn snapshot(bridge: &HostBridge) -> Result<Value, ScriptError> {
    let snapshot = load_snapshot(bridge).await?;
    serde_json::to_value(snapshot).map_err(|e| ScriptError::runtime(e.to_string()))
}

pub(crate) async fn accounts(bridge: &HostBridge) -> Result<Value, ScriptError> {
    Ok(Value::Array(load_snapshot(bridge).await?.accounts))
}

pub(crate) async fn selected(bridge: &HostBridge) -> Result<Value, ScriptError> {
    let snapshot = load_snapshot(bridge).await?;
    Ok(json!({
        "ids": snapshot.selection,
        "accounts": snapshot.selected_accounts(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_command() {
        assert!(validate_command("accounts.launch").is_ok());
        assert!(validate_command("ns:cmd-1_x").is_ok());
        assert!(validate_command("").is_err());
        assert!(validate_command("rm -rf").is_err());
        assert!(validate_command(&"a".repeat(MAX_COMMAND_LEN + 1)).is_err());
    }
}
