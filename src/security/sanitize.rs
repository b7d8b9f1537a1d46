//! Source text sanitization.
//!
//! Scripts are routinely pasted from chat clients, wikis and word processors,
//! which smuggle in smart quotes, zero-width joiners, bidi overrides and
//! Markdown fences. [`sanitize_source`] folds all of that back to plain text
//! so the same paste always compiles the same way.
//!
//! The transform is idempotent: passes repeat until the text stops changing,
//! so `sanitize_source(sanitize_source(x)) == sanitize_source(x)`.

use unicode_normalization::UnicodeNormalization;

/// Normalize script source text.
#[must_use]
pub fn sanitize_source(source: &str) -> String {
    let mut current = sanitize_pass(source);
    // After the first pass only fence unwrapping changes the text, and that
    // always shortens it, so this reaches a fixed point.
    loop {
        let next = sanitize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Drop every non-ASCII character. Used by the lenient compile fallback.
#[must_use]
pub fn strip_non_ascii(source: &str) -> String {
    source.chars().filter(char::is_ascii).collect()
}

fn sanitize_pass(source: &str) -> String {
    let unified = source.replace("\r\n", "\n").replace('\r', "\n");

    let mapped: String = unified
        .chars()
        .filter(|c| !is_stripped(*c))
        .map(map_punctuation)
        .collect();

    let normalized: String = mapped.nfkc().collect();
    strip_code_fence(&normalized)
}

/// Control, bidi and zero-width characters removed outright.
fn is_stripped(c: char) -> bool {
    match c {
        '\t' | '\n' => false,
        '\u{0000}'..='\u{001F}' | '\u{007F}'..='\u{009F}' => true,
        // Bidi marks, embeddings, overrides and isolates.
        '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' => {
            true
        }
        // Zero-width space/joiners, word joiner, BOM, Mongolian vowel separator.
        '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{180E}' => true,
        _ => false,
    }
}

fn map_punctuation(c: char) -> char {
    match c {
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' | '\u{2035}' => '\'',
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' | '\u{2036}' => '"',
        '\u{2010}'..='\u{2015}' | '\u{2212}' => '-',
        '\u{02CB}' | '\u{FF40}' => '`',
        other => other,
    }
}

/// Remove a single fence that wraps the whole text, e.g. ```` ```lua ... ``` ````.
fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    for fence in ["```", "~~~"] {
        let Some(rest) = trimmed.strip_prefix(fence) else {
            continue;
        };
        let Some(body) = rest.strip_suffix(fence) else {
            continue;
        };
        // The opening line may carry an info string (`lua`, `javascript`, ...).
        let Some(newline) = body.find('\n') else {
            continue;
        };
        let info = &body[..newline];
        if info.contains(fence) || info.trim().contains(char::is_whitespace) {
            continue;
        }
        let inner = &body[newline + 1..];
        if inner.contains(fence) {
            // More than one fenced block: not a single enclosing fence.
            continue;
        }
        return inner.trim_end_matches(['\n', ' ', '\t']).to_string();
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smart_quotes_and_dashes() {
        let input = "log.info(\u{201C}hi\u{201D}) \u{2014}\u{2014} x = \u{2018}a\u{2019}";
        assert_eq!(sanitize_source(input), "log.info(\"hi\") -- x = 'a'");
    }

    #[test]
    fn test_strips_zero_width_and_bidi() {
        let input = "lo\u{200B}cal\u{202E} x\u{FEFF} = 1\u{2066}";
        assert_eq!(sanitize_source(input), "local x = 1");
    }

    #[test]
    fn test_strips_controls_but_keeps_tabs_and_newlines() {
        let input = "a\u{0007}\tb\r\nc\u{0085}";
        assert_eq!(sanitize_source(input), "a\tb\nc");
    }

    #[test]
    fn test_nfkc_folds_compatibility_forms() {
        // Fullwidth letters and a non-breaking space.
        let input = "\u{FF4C}\u{FF4F}\u{FF43}\u{FF41}\u{FF4C}\u{00A0}x";
        assert_eq!(sanitize_source(input), "local x");
    }

    #[test]
    fn test_strips_enclosing_fence_with_info_string() {
        let input = "```lua\nlocal x = 1\nlog.info(x)\n```";
        assert_eq!(sanitize_source(input), "local x = 1\nlog.info(x)");
    }

    #[test]
    fn test_keeps_text_with_multiple_fences() {
        let input = "```\na\n```\ntext\n```\nb\n```";
        assert_eq!(sanitize_source(input), input);
    }

    #[test]
    fn test_nested_fence_reaches_fixed_point() {
        let input = "```\n~~~\nx = 1\n~~~\n```";
        let once = sanitize_source(input);
        assert_eq!(once, "x = 1");
        assert_eq!(sanitize_source(&once), once);
    }

    #[test]
    fn test_deepest_fence_nesting_is_a_fixed_point() {
        // Smart backticks only become a fence during the first pass; the
        // inner fence needs a second one.
        let input = "\u{02CB}\u{02CB}\u{02CB}lua\n~~~\nprint(\u{201C}x\u{201D})\n~~~\n\u{02CB}\u{02CB}\u{02CB}";
        let out = sanitize_source(input);
        assert_eq!(out, "print(\"x\")");
        assert_eq!(sanitize_pass(&out), out);
    }

    #[test]
    fn test_idempotent_on_tricky_inputs() {
        let inputs = [
            "",
            "plain ascii",
            "e\u{200B}\u{0301}",
            "\u{2033}quoted\u{2033}",
            "```\n```\nx\n```\n```",
            "\u{FB01}le \u{2026} \u{212B}",
            "\r\r\n\u{200D}\u{202A}",
            "~~~lua\n  print(\u{2018}x\u{2019})\n~~~\n",
        ];
        for input in inputs {
            let once = sanitize_source(input);
            assert_eq!(sanitize_source(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_strip_non_ascii() {
        assert_eq!(strip_non_ascii("a\u{00E9}b\u{1F600}c"), "abc");
    }
}
