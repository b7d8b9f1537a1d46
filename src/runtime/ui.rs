//! Declarative UI elements a script publishes to the host surface.
//!
//! A script owns the *set* of its elements (`ui.set`, `ui.patch`,
//! `ui.clear`); the surface only edits element values, which come back to
//! the script as `ui.event`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ScriptError;

/// Maximum number of elements per script.
pub const MAX_UI_ELEMENTS: usize = 64;
/// Maximum element id length (characters).
pub const MAX_UI_ID_LEN: usize = 64;
/// Maximum label / text length (characters).
const MAX_UI_TEXT_LEN: usize = 1000;

/// Widget type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiElementKind {
    /// Clickable button; emits `ui.event` with no value.
    Button,
    /// Static or editable single-line text.
    Text,
    /// Numeric input.
    Number,
    /// Boolean switch.
    Toggle,
    /// Choice among `options`.
    Select,
    /// Multi-line text.
    Textarea,
    /// Small status pill.
    Badge,
    /// Visual separator.
    Divider,
}

/// One declared widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptUiElement {
    /// Unique within the script's element set.
    pub id: String,
    /// Widget type.
    #[serde(rename = "type")]
    pub kind: UiElementKind,
    /// Caption shown next to the widget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Current value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Choices for `select`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,
    /// Placeholder for text inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    /// Lower bound for `number`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound for `number`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Step for `number`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Colour hint for `badge` / `button` (`info`, `success`, `warning`, `danger`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    /// Rendered but not editable.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

fn check_element(element: &ScriptUiElement) -> Result<(), ScriptError> {
    let id = element.id.trim();
    if id.is_empty() {
        return Err(ScriptError::validation("ui element id must not be empty"));
    }
    if element.id.chars().count() > MAX_UI_ID_LEN {
        return Err(ScriptError::validation(format!(
            "ui element id exceeds {MAX_UI_ID_LEN} characters"
        )));
    }
    for text in [&element.label, &element.placeholder].into_iter().flatten() {
        if text.chars().count() > MAX_UI_TEXT_LEN {
            return Err(ScriptError::validation(format!(
                "ui element '{}' text exceeds {MAX_UI_TEXT_LEN} characters",
                element.id
            )));
        }
    }
    if let (Some(min), Some(max)) = (element.min, element.max) {
        if min > max {
            return Err(ScriptError::validation(format!(
                "ui element '{}' has min greater than max",
                element.id
            )));
        }
    }
    Ok(())
}

/// Parse a full element list for `ui.set`.
pub fn parse_elements(value: Value) -> Result<Vec<ScriptUiElement>, ScriptError> {
    let Value::Array(items) = value else {
        return Err(ScriptError::validation("ui.set expects an array of elements"));
    };
    if items.len() > MAX_UI_ELEMENTS {
        return Err(ScriptError::validation(format!(
            "at most {MAX_UI_ELEMENTS} ui elements are allowed"
        )));
    }
    let mut elements = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let element: ScriptUiElement = serde_json::from_value(item)
            .map_err(|e| ScriptError::validation(format!("ui element #{}: {e}", idx + 1)))?;
        check_element(&element)?;
        if elements.iter().any(|e: &ScriptUiElement| e.id == element.id) {
            return Err(ScriptError::validation(format!(
                "duplicate ui element id '{}'",
                element.id
            )));
        }
        elements.push(element);
    }
    Ok(elements)
}

/// Merge `fields` into the element with `id` (`ui.patch`).
///
/// `id` itself can't be changed; a `null` field resets it to its default.
pub fn patch_element(
    elements: &mut [ScriptUiElement],
    id: &str,
    fields: &Map<String, Value>,
) -> Result<(), ScriptError> {
    let slot = elements
        .iter_mut()
        .find(|e| e.id == id)
        .ok_or_else(|| ScriptError::validation(format!("no ui element with id '{id}'")))?;

    let Value::Object(mut merged) = serde_json::to_value(&*slot)
        .map_err(|e| ScriptError::runtime(format!("ui element encode failed: {e}")))?
    else {
        return Err(ScriptError::runtime("ui element did not encode as an object"));
    };
    for (key, value) in fields {
        if key == "id" {
            continue;
        }
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }

    let patched: ScriptUiElement = serde_json::from_value(Value::Object(merged))
        .map_err(|e| ScriptError::validation(format!("ui.patch '{id}': {e}")))?;
    check_element(&patched)?;
    *slot = patched;
    Ok(())
}

/// Record a value edit made on the surface. Returns `false` for unknown ids.
pub fn apply_value_edit(elements: &mut [ScriptUiElement], id: &str, value: Option<Value>) -> bool {
    match elements.iter_mut().find(|e| e.id == id) {
        Some(element) => {
            if value.is_some() {
                element.value = value;
            }
            true
        }
        None => false,
    }
}
