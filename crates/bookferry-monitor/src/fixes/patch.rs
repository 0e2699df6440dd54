//! Structured patch language for supervisor code fixes.
//!
//! Free-form "edit this file" output is never applied. A patch is one of
//! three tagged shapes, each strictly parsed before anything touches disk,
//! and the patched text must pass a delimiter check before the caller is
//! allowed to commit it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("function `{name}` not found")]
    FunctionNotFound { name: String },
    #[error("function `{name}` has no body block")]
    FunctionUnterminated { name: String },
    #[error("replacement target not found")]
    TargetNotFound,
    #[error("replacement target is ambiguous ({occurrences} occurrences)")]
    AmbiguousTarget { occurrences: usize },
    #[error("unified diff is malformed: {0}")]
    MalformedDiff(String),
    #[error("hunk context does not match the source")]
    HunkMismatch,
    #[error("patched source fails the syntax check: {0}")]
    SyntaxRejected(String),
}

/// The three supported patch shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchSpec {
    /// Replace a whole `fn` item by name.
    FunctionReplace { name: String, body: String },
    /// Replace `old` with `new`, anchored by optional surrounding context.
    Replace {
        #[serde(default)]
        context_before: String,
        old: String,
        new: String,
        #[serde(default)]
        context_after: String,
    },
    /// Classic unified diff hunks (`@@ … @@` with ` `, `-`, `+` lines).
    UnifiedDiff { hunks: String },
}

impl PatchSpec {
    /// Apply the patch to `source`, returning the patched text. The result
    /// has already passed the delimiter-balance check.
    pub fn apply(&self, source: &str) -> Result<String, PatchError> {
        let patched = match self {
            PatchSpec::FunctionReplace { name, body } => replace_function(source, name, body)?,
            PatchSpec::Replace {
                context_before,
                old,
                new,
                context_after,
            } => replace_anchored(source, context_before, old, new, context_after)?,
            PatchSpec::UnifiedDiff { hunks } => apply_unified_diff(source, hunks)?,
        };

        check_delimiters(&patched)?;
        Ok(patched)
    }
}

/// Replace the item `fn <name>` including attributes on the signature line
/// span from the `fn` keyword through its balanced body block.
fn replace_function(source: &str, name: &str, body: &str) -> Result<String, PatchError> {
    let needle = format!("fn {name}");
    let mut search_from = 0;
    let start = loop {
        let offset = source[search_from..]
            .find(&needle)
            .ok_or_else(|| PatchError::FunctionNotFound {
                name: name.to_string(),
            })?;
        let absolute = search_from + offset;
        // Require a word boundary after the name so `fn foo` does not match
        // `fn foobar`.
        let after = absolute + needle.len();
        let boundary = source[after..]
            .chars()
            .next()
            .map(|c| !c.is_alphanumeric() && c != '_')
            .unwrap_or(true);
        if boundary {
            break absolute;
        }
        search_from = after;
    };

    // Include the start of the line (pub/async/attributes stay on it).
    let line_start = source[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);

    let open = source[start..]
        .find('{')
        .map(|i| start + i)
        .ok_or_else(|| PatchError::FunctionUnterminated {
            name: name.to_string(),
        })?;
    let close = matching_brace(source, open).ok_or_else(|| PatchError::FunctionUnterminated {
        name: name.to_string(),
    })?;

    let mut patched = String::with_capacity(source.len() + body.len());
    patched.push_str(&source[..line_start]);
    patched.push_str(body.trim_end());
    patched.push('\n');
    patched.push_str(source[close + 1..].trim_start_matches('\n'));
    Ok(patched)
}

fn replace_anchored(
    source: &str,
    context_before: &str,
    old: &str,
    new: &str,
    context_after: &str,
) -> Result<String, PatchError> {
    let anchored = format!("{context_before}{old}{context_after}");
    let occurrences = source.matches(&anchored).count();
    match occurrences {
        0 => Err(PatchError::TargetNotFound),
        1 => {
            let replacement = format!("{context_before}{new}{context_after}");
            Ok(source.replacen(&anchored, &replacement, 1))
        }
        n => Err(PatchError::AmbiguousTarget { occurrences: n }),
    }
}

/// Minimal unified-diff application: hunk positions are taken as hints, the
/// old-side text must match exactly somewhere in the file.
fn apply_unified_diff(source: &str, hunks: &str) -> Result<String, PatchError> {
    let mut patched = source.to_string();
    let mut current: Option<(Vec<String>, Vec<String>)> = None;
    let mut parsed_any = false;

    let mut apply_current =
        |patched: &mut String, hunk: Option<(Vec<String>, Vec<String>)>| -> Result<(), PatchError> {
            let Some((old_lines, new_lines)) = hunk else {
                return Ok(());
            };
            let old_text = old_lines.join("\n");
            let new_text = new_lines.join("\n");
            let occurrences = patched.matches(&old_text).count();
            match occurrences {
                0 => Err(PatchError::HunkMismatch),
                1 => {
                    *patched = patched.replacen(&old_text, &new_text, 1);
                    Ok(())
                }
                n => Err(PatchError::AmbiguousTarget { occurrences: n }),
            }
        };

    for line in hunks.lines() {
        if line.starts_with("---") || line.starts_with("+++") {
            continue;
        }
        if line.starts_with("@@") {
            parsed_any = true;
            apply_current(&mut patched, current.take())?;
            current = Some((Vec::new(), Vec::new()));
            continue;
        }
        let Some((old_lines, new_lines)) = current.as_mut() else {
            if line.trim().is_empty() {
                continue;
            }
            return Err(PatchError::MalformedDiff(format!(
                "content before first hunk header: `{line}`"
            )));
        };
        match line.chars().next() {
            Some('+') => new_lines.push(line[1..].to_string()),
            Some('-') => old_lines.push(line[1..].to_string()),
            Some(' ') => {
                old_lines.push(line[1..].to_string());
                new_lines.push(line[1..].to_string());
            }
            None => {
                old_lines.push(String::new());
                new_lines.push(String::new());
            }
            Some(_) => {
                return Err(PatchError::MalformedDiff(format!(
                    "unexpected line prefix: `{line}`"
                )));
            }
        }
    }
    apply_current(&mut patched, current.take())?;

    if !parsed_any {
        return Err(PatchError::MalformedDiff("no hunk headers".to_string()));
    }
    Ok(patched)
}

/// Index of the `}` closing the `{` at `open`, skipping string, char, and
/// comment contents.
fn matching_brace(source: &str, open: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    debug_assert_eq!(bytes.get(open), Some(&b'{'));
    let mut depth = 0i64;
    let mut state = LexState::Code;
    let mut i = open;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            LexState::Code => match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                b'"' => state = LexState::Str,
                b'\'' => {
                    // Char literal: skip `'x'` or `'\x'`; lifetimes have no
                    // closing quote and fall through harmlessly.
                    if next == Some(b'\\') {
                        i += 3;
                    } else if bytes.get(i + 2) == Some(&b'\'') {
                        i += 2;
                    }
                }
                b'/' if next == Some(b'/') => state = LexState::LineComment,
                b'/' if next == Some(b'*') => {
                    state = LexState::BlockComment;
                    i += 1;
                }
                _ => {}
            },
            LexState::Str => match b {
                b'\\' => i += 1,
                b'"' => state = LexState::Code,
                _ => {}
            },
            LexState::LineComment => {
                if b == b'\n' {
                    state = LexState::Code;
                }
            }
            LexState::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = LexState::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    None
}

#[derive(Clone, Copy, PartialEq)]
enum LexState {
    Code,
    Str,
    LineComment,
    BlockComment,
}

/// Cheap structural validation: every `{[(` closes in order. Runs after
/// every patch; the full compile check is the caller's second gate.
pub fn check_delimiters(source: &str) -> Result<(), PatchError> {
    let bytes = source.as_bytes();
    let mut stack: Vec<u8> = Vec::new();
    let mut state = LexState::Code;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            LexState::Code => match b {
                b'{' | b'[' | b'(' => stack.push(b),
                b'}' | b']' | b')' => {
                    let expected = match b {
                        b'}' => b'{',
                        b']' => b'[',
                        _ => b'(',
                    };
                    if stack.pop() != Some(expected) {
                        return Err(PatchError::SyntaxRejected(format!(
                            "unbalanced `{}` near byte {i}",
                            b as char
                        )));
                    }
                }
                b'"' => state = LexState::Str,
                b'\'' => {
                    if next == Some(b'\\') {
                        i += 3;
                    } else if bytes.get(i + 2) == Some(&b'\'') {
                        i += 2;
                    }
                }
                b'/' if next == Some(b'/') => state = LexState::LineComment,
                b'/' if next == Some(b'*') => {
                    state = LexState::BlockComment;
                    i += 1;
                }
                _ => {}
            },
            LexState::Str => match b {
                b'\\' => i += 1,
                b'"' => state = LexState::Code,
                _ => {}
            },
            LexState::LineComment => {
                if b == b'\n' {
                    state = LexState::Code;
                }
            }
            LexState::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = LexState::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    if !stack.is_empty() {
        return Err(PatchError::SyntaxRejected(format!(
            "{} unclosed delimiter(s)",
            stack.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"pub fn fetch_batch(key: i64) -> Vec<i64> {
    let limit = 1000;
    query(key, limit)
}

fn helper() {
    // a brace in a comment }
    let s = "a brace in a string }";
    let _ = s;
}
"#;

    #[test]
    fn function_replace_swaps_whole_body() {
        let patch = PatchSpec::FunctionReplace {
            name: "fetch_batch".to_string(),
            body: "pub fn fetch_batch(key: i64) -> Vec<i64> {\n    query(key, 500)\n}".to_string(),
        };
        let patched = patch.apply(SOURCE).expect("apply");
        assert!(patched.contains("query(key, 500)"));
        assert!(!patched.contains("let limit = 1000;"));
        assert!(patched.contains("fn helper()"));
    }

    #[test]
    fn function_replace_ignores_braces_in_strings_and_comments() {
        let patch = PatchSpec::FunctionReplace {
            name: "helper".to_string(),
            body: "fn helper() {}".to_string(),
        };
        let patched = patch.apply(SOURCE).expect("apply");
        assert!(patched.contains("fn helper() {}"));
        assert!(!patched.contains("a brace in a string"));
    }

    #[test]
    fn function_replace_requires_exact_name() {
        let patch = PatchSpec::FunctionReplace {
            name: "fetch".to_string(),
            body: "fn fetch() {}".to_string(),
        };
        assert_eq!(
            patch.apply(SOURCE),
            Err(PatchError::FunctionNotFound {
                name: "fetch".to_string()
            })
        );
    }

    #[test]
    fn anchored_replace_applies_once() {
        let patch = PatchSpec::Replace {
            context_before: "let limit = ".to_string(),
            old: "1000".to_string(),
            new: "250".to_string(),
            context_after: ";".to_string(),
        };
        let patched = patch.apply(SOURCE).expect("apply");
        assert!(patched.contains("let limit = 250;"));
    }

    #[test]
    fn anchored_replace_rejects_ambiguity() {
        let source = "let a = 1;\nlet a = 1;\n";
        let patch = PatchSpec::Replace {
            context_before: String::new(),
            old: "let a = 1;".to_string(),
            new: "let a = 2;".to_string(),
            context_after: String::new(),
        };
        assert_eq!(
            patch.apply(source),
            Err(PatchError::AmbiguousTarget { occurrences: 2 })
        );
    }

    #[test]
    fn unified_diff_applies_hunk() {
        let patch = PatchSpec::UnifiedDiff {
            hunks: "@@ -2,2 +2,2 @@\n     let limit = 1000;\n-    query(key, limit)\n+    query(key, limit.min(100))\n".to_string(),
        };
        let patched = patch.apply(SOURCE).expect("apply");
        assert!(patched.contains("query(key, limit.min(100))"));
    }

    #[test]
    fn unified_diff_rejects_stale_context() {
        let patch = PatchSpec::UnifiedDiff {
            hunks: "@@ -1,1 +1,1 @@\n-    let limit = 9999;\n+    let limit = 1;\n".to_string(),
        };
        assert_eq!(patch.apply(SOURCE), Err(PatchError::HunkMismatch));
    }

    #[test]
    fn unbalanced_patch_is_rejected() {
        let patch = PatchSpec::FunctionReplace {
            name: "helper".to_string(),
            body: "fn helper() {".to_string(),
        };
        assert!(matches!(
            patch.apply(SOURCE),
            Err(PatchError::SyntaxRejected(_))
        ));
    }

    #[test]
    fn spec_round_trips_through_json() {
        let raw = r#"{"kind": "replace", "old": "a", "new": "b"}"#;
        let patch: PatchSpec = serde_json::from_str(raw).expect("decode");
        assert!(matches!(patch, PatchSpec::Replace { .. }));

        let raw = r#"{"kind": "function_replace", "name": "f", "body": "fn f() {}"}"#;
        let patch: PatchSpec = serde_json::from_str(raw).expect("decode");
        assert!(matches!(patch, PatchSpec::FunctionReplace { .. }));
    }

    #[test]
    fn delimiter_check_accepts_real_code() {
        assert!(check_delimiters(SOURCE).is_ok());
        assert!(check_delimiters("fn broken( {").is_err());
    }
}
