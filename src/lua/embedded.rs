//! Lua sources compiled into the binary.
//!
//! Loaded into every script's state, in order, after the Rust primitives
//! and before the script itself.

/// `(chunk name, source)` pairs in load order.
const EMBEDDED_LUA_FILES: &[(&str, &str)] = &[("=prelude", include_str!("lib/prelude.lua"))];

/// Get embedded Lua file content by chunk name.
#[must_use]
pub fn get(name: &str) -> Option<&'static str> {
    EMBEDDED_LUA_FILES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, source)| *source)
}

/// All embedded files as `(chunk name, source)` pairs.
#[inline]
#[must_use]
pub fn all() -> &'static [(&'static str, &'static str)] {
    EMBEDDED_LUA_FILES
}
