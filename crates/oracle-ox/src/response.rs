//! Strict parsing of oracle responses.

use serde::{Deserialize, Serialize};

/// Recommended intervention class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    Restart,
    Config,
    Code,
    ScaleDown,
}

/// Structured recommendation. Advisory only: the caller validates and may
/// discard any field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advice {
    pub root_cause: String,
    pub fix_type: FixKind,
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
    /// Config parameters for `fix_type = config` (e.g. parallel uploads).
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    /// Structured patch for `fix_type = code`.
    #[serde(default)]
    pub patch: Option<serde_json::Value>,
}

impl Advice {
    /// What the supervisor falls back to when a response is unusable.
    pub fn fallback_restart(reason: &str) -> Self {
        Self {
            root_cause: reason.to_string(),
            fix_type: FixKind::Restart,
            confidence: 0.5,
            description: "restart the worker from its checkpoint".to_string(),
            params: None,
            patch: None,
        }
    }
}

/// Extract the advice object from a model response. The model is instructed
/// to emit bare JSON, but fenced or prefixed output is tolerated; anything
/// less yields the restart fallback.
pub fn parse_advice(text: &str) -> Advice {
    for candidate in json_candidates(text) {
        if let Ok(mut advice) = serde_json::from_str::<Advice>(candidate) {
            advice.confidence = advice.confidence.clamp(0.0, 1.0);
            return advice;
        }
    }
    Advice::fallback_restart("unparseable oracle response")
}

/// Balanced `{…}` slices of `text`, outermost first.
fn json_candidates(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0i64;
        let mut in_string = false;
        let mut end = None;
        for (i, b) in bytes.iter().enumerate().skip(start) {
            match b {
                b'"' if i == 0 || bytes[i - 1] != b'\\' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(end) => {
                candidates.push(&text[start..=end]);
                search_from = end + 1;
            }
            None => break,
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_json_parses() {
        let advice = parse_advice(
            r#"{"root_cause": "disk saturation", "fix_type": "scale_down", "confidence": 0.9, "description": "kill one worker"}"#,
        );
        assert_eq!(advice.fix_type, FixKind::ScaleDown);
        assert_eq!(advice.root_cause, "disk saturation");
        assert!((advice.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn fenced_json_parses() {
        let text = "Here is my analysis:\n```json\n{\"root_cause\": \"loop\", \"fix_type\": \"code\", \"confidence\": 0.8, \"patch\": {\"kind\": \"replace\"}}\n```\nGood luck!";
        let advice = parse_advice(text);
        assert_eq!(advice.fix_type, FixKind::Code);
        assert!(advice.patch.is_some());
    }

    #[test]
    fn confidence_is_clamped() {
        let advice =
            parse_advice(r#"{"root_cause": "x", "fix_type": "restart", "confidence": 4.2}"#);
        assert!((advice.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn prose_falls_back_to_restart() {
        let advice = parse_advice("I could not determine the cause.");
        assert_eq!(advice.fix_type, FixKind::Restart);
        assert!((advice.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_fix_type_falls_back() {
        let advice =
            parse_advice(r#"{"root_cause": "x", "fix_type": "reboot_the_planet", "confidence": 1}"#);
        assert_eq!(advice.fix_type, FixKind::Restart);
    }

    #[test]
    fn braces_inside_strings_do_not_break_extraction() {
        let text = r#"note {"root_cause": "log says {weird}", "fix_type": "config", "confidence": 0.7, "params": {"parallel_uploads": 1}}"#;
        let advice = parse_advice(text);
        assert_eq!(advice.fix_type, FixKind::Config);
        assert_eq!(
            advice.params.as_ref().and_then(|p| p.get("parallel_uploads")),
            Some(&serde_json::json!(1))
        );
    }
}
