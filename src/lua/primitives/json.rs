//! JSON conversion between Lua values and `serde_json`.
//!
//! Every payload a script sends to the host and every result it gets back
//! goes through the two converters here. The `json` global exposes the same
//! conversions to script code.
//!
//! # Usage in Lua
//!
//! ```lua
//! local text, err = json.encode({ name = "bot", tags = { "a", "b" } })
//! local data, err = json.decode('{"name":"bot"}')
//! local pretty = json.encode({ a = 1 }, { pretty = true })
//! ```
//!
//! Functions that can fail return `value, nil` on success and
//! `nil, error_message` on failure.

use anyhow::{anyhow, Result};
use mlua::{Lua, LuaSerdeExt, Table, Value};

/// Convert a `serde_json::Value` to a Lua value, mapping JSON null to `nil`.
///
/// `LuaSerdeExt::to_value` maps null to a light-userdata sentinel which is
/// truthy in Lua; scripts expect `nil`.
pub fn json_to_lua(lua: &Lua, v: &serde_json::Value) -> mlua::Result<Value> {
    match v {
        serde_json::Value::Null => Ok(Value::Nil),
        serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
        serde_json::Value::Number(n) => Ok(n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Number))
            .unwrap_or(Value::Nil)),
        serde_json::Value::String(s) => lua.create_string(s).map(Value::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table_with_capacity(arr.len(), 0)?;
            for (i, item) in arr.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, val) in map.iter().filter(|(_, v)| !v.is_null()) {
                table.raw_set(lua.create_string(key)?, json_to_lua(lua, val)?)?;
            }
            Ok(Value::Table(table))
        }
    }
}

/// Convert a Lua value to JSON.
///
/// Sequences become arrays, other tables objects, and an empty table an
/// empty object. Functions, threads and userdata are errors.
pub fn lua_to_json(lua: &Lua, value: Value) -> mlua::Result<serde_json::Value> {
    lua.from_value(value)
}

/// Register the `json` global.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(lua: &Lua) -> Result<()> {
    let json_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create json table: {e}"))?;

    // json.encode(value, opts?) -> (string, nil) or (nil, error)
    let encode_fn = lua
        .create_function(|lua, (value, opts): (Value, Option<Table>)| {
            let pretty = match opts {
                Some(opts) => opts.get::<Option<bool>>("pretty")?.unwrap_or(false),
                None => false,
            };
            let json_value = match lua_to_json(lua, value) {
                Ok(v) => v,
                Err(e) => return Ok((None::<String>, Some(format!("Failed to encode JSON: {e}")))),
            };
            let encoded = if pretty {
                serde_json::to_string_pretty(&json_value)
            } else {
                serde_json::to_string(&json_value)
            };
            Ok(match encoded {
                Ok(s) => (Some(s), None),
                Err(e) => (None, Some(format!("Failed to encode JSON: {e}"))),
            })
        })
        .map_err(|e| anyhow!("Failed to create json.encode function: {e}"))?;
    json_table
        .set("encode", encode_fn)
        .map_err(|e| anyhow!("Failed to set json.encode: {e}"))?;

    // json.decode(string) -> (value, nil) or (nil, error)
    let decode_fn = lua
        .create_function(|lua, s: String| {
            match serde_json::from_str::<serde_json::Value>(&s) {
                Ok(json_value) => Ok((json_to_lua(lua, &json_value)?, None::<String>)),
                Err(e) => Ok((Value::Nil, Some(format!("Failed to decode JSON: {e}")))),
            }
        })
        .map_err(|e| anyhow!("Failed to create json.decode function: {e}"))?;
    json_table
        .set("decode", decode_fn)
        .map_err(|e| anyhow!("Failed to set json.decode: {e}"))?;

    // json.null: sentinel for an explicit null inside a payload.
    json_table
        .set("null", lua.null())
        .map_err(|e| anyhow!("Failed to set json.null: {e}"))?;

    lua.globals()
        .set("json", json_table)
        .map_err(|e| anyhow!("Failed to register json table globally: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lua() -> Lua {
        let lua = Lua::new();
        register(&lua).expect("Should register json primitives");
        lua
    }

    #[test]
    fn test_encode_table_and_sequence() {
        let lua = lua();
        let (text, err): (Option<String>, Option<String>) = lua
            .load(r#"return json.encode({ name = "bot", tags = { "a", "b" } })"#)
            .eval()
            .expect("json.encode should be callable");
        assert!(err.is_none());
        let parsed: serde_json::Value =
            serde_json::from_str(&text.expect("string")).expect("valid JSON");
        assert_eq!(parsed, json!({"name": "bot", "tags": ["a", "b"]}));
    }

    #[test]
    fn test_encode_pretty_option() {
        let lua = lua();
        let text: String = lua
            .load(r#"return (json.encode({ a = 1 }, { pretty = true }))"#)
            .eval()
            .expect("encode");
        assert!(text.contains('\n'));
    }

    #[test]
    fn test_encode_function_is_error_value() {
        let lua = lua();
        let (text, err): (Option<String>, Option<String>) = lua
            .load(r#"return json.encode({ f = function() end })"#)
            .eval()
            .expect("encode returns error pair");
        assert!(text.is_none());
        assert!(err.expect("error").contains("Failed to encode JSON"));
    }

    #[test]
    fn test_decode_null_becomes_nil() {
        let lua = lua();
        lua.load(
            r#"
            local data, err = json.decode('{"key": null, "n": [1, 2.5]}')
            assert(err == nil)
            assert(data.key == nil)
            assert(data.n[1] == 1 and math.type(data.n[1]) == "integer")
            assert(data.n[2] == 2.5)
        "#,
        )
        .exec()
        .expect("decode test should pass");
    }

    #[test]
    fn test_decode_invalid() {
        let lua = lua();
        let (value, err): (Option<String>, Option<String>) = lua
            .load(r#"return json.decode("not json {")"#)
            .eval()
            .expect("decode is callable");
        assert!(value.is_none());
        assert!(err.expect("error").contains("Failed to decode JSON"));
    }

    #[test]
    fn test_lua_to_json_keeps_null_sentinel() {
        let lua = lua();
        let value: Value = lua
            .load(r#"return { a = json.null, b = 1 }"#)
            .eval()
            .expect("eval");
        assert_eq!(
            lua_to_json(&lua, value).expect("convert"),
            json!({"a": null, "b": 1})
        );
    }
}
