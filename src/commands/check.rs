//! `scriptbox check`: sanitize and compile a file without running it.

use std::path::Path;

use anyhow::{Context, Result};

use crate::error::ScriptError;
use crate::lua::check_source;
use crate::security::sanitize_source;

/// Result of checking one file.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Compiled as written (after sanitizing).
    Ok,
    /// Compiled only after non-ASCII characters were removed.
    NeededFallback,
    /// Did not compile.
    Failed(ScriptError),
}

/// Sanitize and compile `source`.
#[must_use]
pub fn check_text(source: &str, fallback: bool) -> CheckOutcome {
    match check_source(&sanitize_source(source), fallback) {
        Ok(false) => CheckOutcome::Ok,
        Ok(true) => CheckOutcome::NeededFallback,
        Err(e) => CheckOutcome::Failed(e),
    }
}

/// Checks the file at `file`, printing the verdict.
///
/// # Errors
///
/// Returns an error if the file can't be read.
pub fn check(file: &Path, fallback: bool) -> Result<CheckOutcome> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let outcome = check_text(&source, fallback);
    match outcome {
        CheckOutcome::Ok => println!("{}: ok", file.display()),
        CheckOutcome::NeededFallback => println!(
            "{}: ok (compiled after removing non-ASCII characters)",
            file.display()
        ),
        CheckOutcome::Failed(ScriptError::Compile { ref diagnostic }) => {
            println!("{}: {diagnostic}", file.display());
            if let Some(ref context) = diagnostic.context {
                println!("    {context}");
                if let Some(column) = diagnostic.column {
                    println!("    {}^", " ".repeat(column.saturating_sub(1) as usize));
                }
            }
        }
        CheckOutcome::Failed(ref e) => println!("{}: {e}", file.display()),
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_text_verdicts() {
        assert_eq!(check_text("return 1", true), CheckOutcome::Ok);
        assert!(matches!(
            check_text("local = 1", true),
            CheckOutcome::Failed(ScriptError::Compile { .. })
        ));
    }

    #[test]
    fn test_sanitizer_runs_before_compile() {
        // Smart quotes are normalized to ASCII before the compiler sees them.
        assert_eq!(check_text("return \u{201C}hi\u{201D}", false), CheckOutcome::Ok);
    }
}
