//! String sanitization for everything the pipeline persists or transmits.
//!
//! The target API rejects NUL bytes outright and several stores silently
//! truncate at the first control character, so every string that leaves the
//! pipeline goes through here first.

/// Options controlling sanitization behavior.
#[derive(Debug, Clone, Copy)]
pub struct SanitizeOptions {
    /// Maximum length in characters; `None` leaves the string unbounded.
    pub max_chars: Option<usize>,
    /// Collapse runs of whitespace into a single space.
    pub collapse_whitespace: bool,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            max_chars: None,
            collapse_whitespace: false,
        }
    }
}

/// Remove NUL and control bytes (other than `\t`, `\n`, `\r`) from `input`.
pub fn sanitize_text(input: &str) -> String {
    sanitize_text_with_options(input, SanitizeOptions::default())
}

/// Sanitize with explicit options; truncation is applied after filtering and
/// always lands on a character boundary.
pub fn sanitize_text_with_options(input: &str, options: SanitizeOptions) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = false;

    for ch in input.chars() {
        if ch == '\0' {
            continue;
        }
        if ch.is_control() && !matches!(ch, '\t' | '\n' | '\r') {
            continue;
        }
        if options.collapse_whitespace {
            if ch.is_whitespace() {
                if !last_was_space && !out.is_empty() {
                    out.push(' ');
                }
                last_was_space = true;
                continue;
            }
            last_was_space = false;
        }
        out.push(ch);
    }

    if options.collapse_whitespace {
        while out.ends_with(' ') {
            out.pop();
        }
    }

    if let Some(max) = options.max_chars {
        if out.chars().count() > max {
            out = out.chars().take(max).collect();
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_nul_bytes() {
        assert_eq!(sanitize_text("war\0 and\0 peace"), "war and peace");
    }

    #[test]
    fn keeps_permitted_control_characters() {
        assert_eq!(sanitize_text("a\tb\nc\rd"), "a\tb\nc\rd");
    }

    #[test]
    fn drops_other_control_characters() {
        assert_eq!(sanitize_text("a\u{0001}b\u{001b}[0mc"), "ab[0mc");
    }

    #[test]
    fn truncates_on_character_boundaries() {
        let options = SanitizeOptions {
            max_chars: Some(2),
            collapse_whitespace: false,
        };
        assert_eq!(sanitize_text_with_options("żółw", options), "żó");
    }

    #[test]
    fn collapses_whitespace_runs() {
        let options = SanitizeOptions {
            max_chars: None,
            collapse_whitespace: true,
        };
        assert_eq!(
            sanitize_text_with_options("  The   Master\t and  Margarita ", options),
            "The Master and Margarita"
        );
    }
}
