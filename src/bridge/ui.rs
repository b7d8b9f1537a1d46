//! `ui.*`: the script's declarative element set.
//!
//! Elements live in the script's runtime record, not in the host, so the
//! last declared UI survives until the next start.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::parse_payload;
use crate::error::ScriptError;
use crate::runtime::state::SharedRecords;
use crate::runtime::ui::{parse_elements, patch_element, ScriptUiElement};

#[derive(Debug, Deserialize)]
struct SetPayload {
    #[serde(default)]
    elements: Value,
}

fn element_list(elements: &[ScriptUiElement]) -> Result<Value, ScriptError> {
    serde_json::to_value(elements).map_err(|e| ScriptError::runtime(format!("ui encode failed: {e}")))
}

pub(crate) fn set(records: &SharedRecords, script_id: &str, payload: Value) -> Result<Value, ScriptError> {
    let payload: SetPayload = parse_payload("ui.set", payload)?;
    // An empty Lua table arrives as `{}`.
    let elements = match payload.elements {
        Value::Null => Vec::new(),
        Value::Object(map) if map.is_empty() => Vec::new(),
        other => parse_elements(other)?,
    };

    let mut records = records.lock().expect("RuntimeRecords mutex poisoned");
    let state = records.state_mut(script_id);
    state.ui = elements;
    element_list(&state.ui)
}

pub(crate) fn patch(records: &SharedRecords, script_id: &str, payload: Value) -> Result<Value, ScriptError> {
    let Value::Object(fields) = payload else {
        return Err(ScriptError::validation("ui.patch expects an object with an id"));
    };
    let id = match fields.get("id") {
        Some(Value::String(id)) => id.clone(),
        _ => return Err(ScriptError::validation("ui.patch: missing string field 'id'")),
    };
    let fields: Map<String, Value> = fields.into_iter().filter(|(k, _)| k != "id").collect();

    let mut records = records.lock().expect("RuntimeRecords mutex poisoned");
    let state = records.state_mut(script_id);
    patch_element(&mut state.ui, &id, &fields)?;
    element_list(&state.ui)
}

pub(crate) fn clear(records: &SharedRecords, script_id: &str) -> Result<Value, ScriptError> {
    let mut records = records.lock().expect("RuntimeRecords mutex poisoned");
    records.state_mut(script_id).ui.clear();
    Ok(Value::Array(Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::state::new_shared_records;
    use serde_json::json;

    #[test]
    fn test_set_patch_clear() {
        let records = new_shared_records(10, 100);
        let list = set(
            &records,
            "s",
            json!({"elements": [
                {"id": "go", "type": "button", "label": "Go"},
                {"id": "n", "type": "number", "value": 1},
            ]}),
        )
        .expect("set");
        assert_eq!(list.as_array().map(Vec::len), Some(2));

        let list = patch(&records, "s", json!({"id": "go", "label": "Run", "disabled": true}))
            .expect("patch");
        assert_eq!(list[0]["label"], "Run");
        assert_eq!(list[0]["disabled"], true);

        assert_eq!(clear(&records, "s").expect("clear"), json!([]));
        assert!(records.lock().expect("lock").state("s").ui.is_empty());
    }

    #[test]
    fn test_empty_table_means_no_elements() {
        let records = new_shared_records(10, 100);
        set(&records, "s", json!({"elements": [{"id": "a", "type": "divider"}]})).expect("set");
        assert_eq!(set(&records, "s", json!({"elements": {}})).expect("set"), json!([]));
    }

    #[test]
    fn test_patch_unknown_id() {
        let records = new_shared_records(10, 100);
        let err = patch(&records, "s", json!({"id": "missing", "label": "x"})).expect_err("unknown");
        assert_eq!(err.kind(), "ValidationError");
        let err = patch(&records, "s", json!({"label": "x"})).expect_err("no id");
        assert_eq!(err.kind(), "ValidationError");
    }
}
