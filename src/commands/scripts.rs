//! Script store commands.
//!
//! # Examples
//!
//! ```bash
//! # Add a script that may call HTTP endpoints
//! scriptbox add ./weather.lua --name Weather --trusted --allow http
//!
//! # Show every stored script
//! scriptbox list
//!
//! # Revoke trust (running instances are stopped on the next refresh)
//! scriptbox trust 6f1c... false
//! ```

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::script::{Capability, ManagedScript, ScriptDraft, ScriptPermissions, ScriptStore};

/// Flags accepted by `scriptbox add`.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Display name (defaults to the file stem).
    pub name: Option<String>,
    /// Unlock trust-gated actions.
    pub trusted: bool,
    /// Capabilities to switch on in addition to the baseline.
    pub allow: Vec<String>,
    /// Start with `scriptbox run`.
    pub auto_start: bool,
    /// Store the script disabled.
    pub disabled: bool,
}

/// Parse capability names, failing on the first unknown one.
pub fn parse_capabilities(names: &[String]) -> Result<Vec<Capability>> {
    names
        .iter()
        .map(|name| {
            Capability::from_name(name).with_context(|| {
                let known: Vec<&str> = Capability::ALL.iter().map(|c| c.name()).collect();
                format!("Unknown capability '{name}' (known: {})", known.join(", "))
            })
        })
        .collect()
}

/// One line of `scriptbox list` output.
#[must_use]
pub fn format_row(script: &ManagedScript) -> String {
    let mut flags = Vec::new();
    if !script.enabled {
        flags.push("disabled");
    }
    if script.trusted {
        flags.push("trusted");
    }
    if script.auto_start {
        flags.push("auto-start");
    }
    let caps: Vec<&str> = Capability::ALL
        .iter()
        .filter(|c| script.permissions.allows(**c))
        .map(|c| c.name())
        .collect();
    format!(
        "{:<36}  {:<24}  [{}]  {}",
        script.id,
        script.name,
        flags.join(","),
        caps.join(",")
    )
}

/// Prints every stored script.
pub fn list(store: &ScriptStore) -> Result<()> {
    let scripts = store.list()?;
    if scripts.is_empty() {
        println!("No scripts stored.");
        return Ok(());
    }
    for script in &scripts {
        println!("{}", format_row(script));
    }
    Ok(())
}

/// Stores the Lua file at `file` as a new script.
///
/// # Errors
///
/// Returns an error if the file can't be read, a capability name is
/// unknown, or the store rejects the record.
pub fn add(store: &ScriptStore, file: &Path, options: AddOptions) -> Result<ManagedScript> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut permissions = ScriptPermissions::default();
    for capability in parse_capabilities(&options.allow)? {
        permissions.set(capability, true);
    }
    let name = options.name.or_else(|| {
        file.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
    });

    let script = store.save(ScriptDraft {
        name,
        source: Some(source),
        enabled: Some(!options.disabled),
        trusted: Some(options.trusted),
        auto_start: Some(options.auto_start),
        permissions: Some(permissions),
        ..ScriptDraft::default()
    })?;
    println!("Added {} ({})", script.name, script.id);
    Ok(script)
}

/// Deletes a script by id.
pub fn remove(store: &ScriptStore, id: &str) -> Result<()> {
    if !store.delete(id)? {
        bail!("No script with id {id}");
    }
    println!("Removed {id}");
    Ok(())
}

/// Sets the trust flag of a script.
pub fn trust(store: &ScriptStore, id: &str, trusted: bool) -> Result<ManagedScript> {
    let Some(existing) = store.get(id)? else {
        bail!("No script with id {id}");
    };
    let mut draft = ScriptDraft::from(&existing);
    draft.trusted = Some(trusted);
    let script = store.save(draft)?;
    println!(
        "{} is now {}",
        script.name,
        if trusted { "trusted" } else { "untrusted" }
    );
    Ok(script)
}
