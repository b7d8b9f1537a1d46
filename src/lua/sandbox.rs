//! Interpreter construction and script compilation.
//!
//! A sandboxed state gets the `table`, `string`, `math`, `utf8` and
//! `coroutine` libraries plus an `os` table reduced to time functions.
//! Nothing that reaches the filesystem, loads code or inspects the VM is
//! reachable from script code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::{ChunkMode, Function, HookTriggers, Lua, LuaOptions, StdLib, Table, Value, VmState};

use crate::error::{CompileDiagnostic, ScriptError};
use crate::security::strip_non_ascii;

/// Chunk name of user scripts; error messages start with `script:<line>:`.
pub const SCRIPT_CHUNK_NAME: &str = "=script";
const SCRIPT_MESSAGE_PREFIX: &str = "script:";

/// How often (in VM instructions) the stop flag is checked.
const STOP_CHECK_INTERVAL: u32 = 10_000;

/// Functions of `os` that stay available.
const SAFE_OS_FUNCTIONS: [&str; 4] = ["time", "clock", "date", "difftime"];

/// Globals removed from the base library.
const REMOVED_GLOBALS: [&str; 4] = ["dofile", "loadfile", "load", "require"];

/// Create a sandboxed Lua state.
///
/// `memory_limit` of zero disables the allocator limit. Once `stop_flag`
/// is set, running Lua code fails at the next instruction check.
///
/// # Errors
///
/// Returns an error if the state can't be created or locked down.
pub fn create_sandbox(memory_limit: usize, stop_flag: Option<Arc<AtomicBool>>) -> Result<Lua> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE | StdLib::OS;
    let lua = Lua::new_with(libs, LuaOptions::default())
        .map_err(|e| anyhow!("Failed to create Lua state: {e}"))?;

    if memory_limit > 0 {
        lua.set_memory_limit(memory_limit)
            .map_err(|e| anyhow!("Failed to set Lua memory limit: {e}"))?;
    }

    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals
            .set(name, Value::Nil)
            .map_err(|e| anyhow!("Failed to remove {name}: {e}"))?;
    }

    let string: Table = globals
        .get("string")
        .map_err(|e| anyhow!("Failed to get string table: {e}"))?;
    string
        .set("dump", Value::Nil)
        .map_err(|e| anyhow!("Failed to remove string.dump: {e}"))?;

    let os: Table = globals
        .get("os")
        .map_err(|e| anyhow!("Failed to get os table: {e}"))?;
    let safe_os = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create os table: {e}"))?;
    for name in SAFE_OS_FUNCTIONS {
        let func: Value = os
            .get(name)
            .map_err(|e| anyhow!("Failed to read os.{name}: {e}"))?;
        safe_os
            .set(name, func)
            .map_err(|e| anyhow!("Failed to set os.{name}: {e}"))?;
    }
    globals
        .set("os", safe_os)
        .map_err(|e| anyhow!("Failed to replace os table: {e}"))?;

    if let Some(flag) = stop_flag {
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(STOP_CHECK_INTERVAL),
            move |_, _| {
                if flag.load(Ordering::Relaxed) {
                    Err(mlua::Error::runtime("script stopped"))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );
    }

    Ok(lua)
}

/// A compiled script.
#[derive(Debug)]
pub struct Compiled {
    /// Main chunk, ready to call.
    pub function: Function,
    /// Whether non-ASCII characters had to be stripped to compile.
    pub stripped: bool,
}

fn load(lua: &Lua, source: &str) -> mlua::Result<Function> {
    lua.load(source)
        .set_name(SCRIPT_CHUNK_NAME)
        .set_mode(ChunkMode::Text)
        .into_function()
}

/// Compile `source`, retrying once without non-ASCII characters when
/// `fallback` is enabled.
///
/// The diagnostic always describes the first attempt.
pub fn compile(lua: &Lua, source: &str, fallback: bool) -> Result<Compiled, ScriptError> {
    let first = match load(lua, source) {
        Ok(function) => {
            return Ok(Compiled {
                function,
                stripped: false,
            })
        }
        Err(e) => e,
    };

    if fallback {
        let ascii = strip_non_ascii(source);
        if ascii != source {
            if let Ok(function) = load(lua, &ascii) {
                return Ok(Compiled {
                    function,
                    stripped: true,
                });
            }
        }
    }

    Err(ScriptError::Compile {
        diagnostic: diagnose(&error_message(&first), source),
    })
}

/// Compile `source` in a throwaway sandbox. Returns whether the fallback
/// was needed.
///
/// # Errors
///
/// `Compile` with a diagnostic, or `Runtime` if no interpreter could be
/// created.
pub fn check_source(source: &str, fallback: bool) -> Result<bool, ScriptError> {
    let lua = create_sandbox(0, None).map_err(|e| ScriptError::runtime(format!("{e:#}")))?;
    compile(&lua, source, fallback).map(|compiled| compiled.stripped)
}

/// Innermost message of a Lua error, without callback wrappers.
#[must_use]
pub fn error_message(error: &mlua::Error) -> String {
    match error {
        mlua::Error::SyntaxError { message, .. } | mlua::Error::RuntimeError(message) => {
            message.clone()
        }
        mlua::Error::CallbackError { cause, .. } => error_message(cause),
        mlua::Error::WithContext { cause, context } => {
            format!("{context}: {}", error_message(cause))
        }
        other => other.to_string(),
    }
}

/// Extract line, column and context from a syntax error message like
/// `script:3: '=' expected near 'x'`.
#[must_use]
pub fn diagnose(message: &str, source: &str) -> CompileDiagnostic {
    let parsed = message.strip_prefix(SCRIPT_MESSAGE_PREFIX).and_then(|rest| {
        let (line, text) = rest.split_once(':')?;
        Some((line.trim().parse::<u32>().ok()?, text.trim()))
    });
    let Some((line, text)) = parsed else {
        return CompileDiagnostic {
            message: message.to_string(),
            line: None,
            column: None,
            context: None,
        };
    };

    let source_line = source
        .lines()
        .nth((line as usize).saturating_sub(1))
        .map(str::trim_end);
    let token = near_token(text);
    let column = match (source_line, token) {
        (Some(src), Some(tok)) => src
            .find(tok)
            .map(|byte| src[..byte].chars().count() as u32 + 1),
        _ => None,
    };
    let context = source_line
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    CompileDiagnostic {
        message: text.to_string(),
        line: Some(line),
        column,
        context,
    }
}

/// The quoted token in a `near '<token>'` hint.
fn near_token(text: &str) -> Option<&str> {
    let start = text.rfind("near '")? + "near '".len();
    let rest = &text[start..];
    let end = rest.rfind('\'')?;
    let token = &rest[..end];
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_hides_unsafe_globals() {
        let lua = create_sandbox(0, None).expect("sandbox");
        let missing: Vec<bool> = lua
            .load(
                r#"
                return {
                    io == nil, debug == nil, package == nil, require == nil,
                    load == nil, loadfile == nil, dofile == nil,
                    os.execute == nil, os.exit == nil, os.getenv == nil,
                    string.dump == nil,
                }
            "#,
            )
            .eval()
            .expect("eval");
        assert!(missing.iter().all(|m| *m), "{missing:?}");

        let now: i64 = lua.load("return os.time()").eval().expect("os.time");
        assert!(now > 0);
    }

    #[test]
    fn test_stop_flag_interrupts_loop() {
        let flag = Arc::new(AtomicBool::new(true));
        let lua = create_sandbox(0, Some(Arc::clone(&flag))).expect("sandbox");
        let err = lua
            .load("while true do end")
            .exec()
            .expect_err("loop interrupted");
        assert!(error_message(&err).contains("script stopped"));
    }

    #[test]
    fn test_memory_limit_enforced() {
        let lua = create_sandbox(4 * 1024 * 1024, None).expect("sandbox");
        let result = lua
            .load(r#"local t = {} for i = 1, 1e8 do t[i] = string.rep("x", 64) .. i end"#)
            .exec();
        assert!(matches!(result, Err(mlua::Error::MemoryError(_))));
    }

    #[test]
    fn test_compile_error_diagnostic() {
        let source = "local a = 1\nlocal b = + 2\n";
        let err = check_source(source, true).expect_err("syntax error");
        let ScriptError::Compile { diagnostic } = err else {
            panic!("expected compile error");
        };
        assert_eq!(diagnostic.line, Some(2));
        assert_eq!(diagnostic.column, Some(11));
        assert_eq!(diagnostic.context.as_deref(), Some("local b = + 2"));
        assert!(diagnostic.message.contains("near '+'"));
    }

    #[test]
    fn test_fallback_strips_non_ascii() {
        let source = "local x = 1 \u{00A7}\nreturn x";
        assert!(check_source(source, true).expect("fallback compiles"));
        assert!(check_source(source, false).is_err());
        assert!(!check_source("return 1", true).expect("plain"));
    }

    #[test]
    fn test_diagnose_without_location() {
        let d = diagnose("something odd", "");
        assert_eq!(d.line, None);
        assert_eq!(d.message, "something odd");
    }
}
