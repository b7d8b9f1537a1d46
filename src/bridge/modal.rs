//! `modal.*`: blocking dialogs shown by the surrounding application.

use serde::Deserialize;
use serde_json::Value;

use super::{check_len, parse_payload};
use crate::app::HostApplication;
use crate::error::ScriptError;

/// Maximum dialog title length.
pub const MAX_TITLE_LEN: usize = 200;
/// Maximum dialog message length.
pub const MAX_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Deserialize)]
struct MessagePayload {
    message: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptPayload {
    message: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    default: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonPayload {
    value: Value,
    #[serde(default)]
    title: Option<String>,
}

fn check_text(title: Option<&str>, message: &str) -> Result<(), ScriptError> {
    if let Some(title) = title {
        check_len("modal title", title, MAX_TITLE_LEN)?;
    }
    check_len("modal message", message, MAX_MESSAGE_LEN)
}

fn app_error(action: &str, e: &anyhow::Error) -> ScriptError {
    ScriptError::runtime(format!("{action} failed: {e:#}"))
}

pub(crate) async fn alert(app: &dyn HostApplication, payload: Value) -> Result<Value, ScriptError> {
    let payload: MessagePayload = parse_payload("modal.alert", payload)?;
    check_text(payload.title.as_deref(), &payload.message)?;
    app.alert(payload.title.as_deref(), &payload.message)
        .await
        .map_err(|e| app_error("modal.alert", &e))?;
    Ok(Value::Null)
}

pub(crate) async fn confirm(app: &dyn HostApplication, payload: Value) -> Result<Value, ScriptError> {
    let payload: MessagePayload = parse_payload("modal.confirm", payload)?;
    check_text(payload.title.as_deref(), &payload.message)?;
    let accepted = app
        .confirm(payload.title.as_deref(), &payload.message)
        .await
        .map_err(|e| app_error("modal.confirm", &e))?;
    Ok(Value::Bool(accepted))
}

pub(crate) async fn prompt(app: &dyn HostApplication, payload: Value) -> Result<Value, ScriptError> {
    let payload: PromptPayload = parse_payload("modal.prompt", payload)?;
    check_text(payload.title.as_deref(), &payload.message)?;
    if let Some(ref default) = payload.default {
        check_len("modal default", default, MAX_MESSAGE_LEN)?;
    }
    let answer = app
        .prompt(
            payload.title.as_deref(),
            &payload.message,
            payload.default.as_deref(),
        )
        .await
        .map_err(|e| app_error("modal.prompt", &e))?;
    Ok(answer.map_or(Value::Null, Value::String))
}

pub(crate) async fn json(app: &dyn HostApplication, payload: Value) -> Result<Value, ScriptError> {
    let payload: JsonPayload = parse_payload("modal.json", payload)?;
    if let Some(ref title) = payload.title {
        check_len("modal title", title, MAX_TITLE_LEN)?;
    }
    app.show_json(payload.title.as_deref(), &payload.value)
        .await
        .map_err(|e| app_error("modal.json", &e))?;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::HeadlessApplication;
    use serde_json::json;

    #[tokio::test]
    async fn test_non_interactive_answers() {
        let app = HeadlessApplication::default();
        assert_eq!(
            confirm(&app, json!({"message": "Proceed?"})).await.expect("confirm"),
            json!(false)
        );
        assert_eq!(
            prompt(&app, json!({"message": "Name?", "default": "bob"}))
                .await
                .expect("prompt"),
            json!("bob")
        );
        assert_eq!(
            prompt(&app, json!({"message": "Name?"})).await.expect("prompt"),
            Value::Null
        );
    }

    #[tokio::test]
    async fn test_rejects_oversized_text() {
        let app = HeadlessApplication::default();
        let err = alert(&app, json!({"message": "x".repeat(MAX_MESSAGE_LEN + 1)}))
            .await
            .expect_err("too long");
        assert_eq!(err.kind(), "ValidationError");

        let err = alert(&app, json!({"message": "ok", "title": "t".repeat(MAX_TITLE_LEN + 1)}))
            .await
            .expect_err("title too long");
        assert_eq!(err.kind(), "ValidationError");
    }

    #[tokio::test]
    async fn test_missing_message_is_validation() {
        let app = HeadlessApplication::default();
        let err = confirm(&app, json!({})).await.expect_err("missing");
        assert!(err.to_string().contains("modal.confirm"));
    }
}
