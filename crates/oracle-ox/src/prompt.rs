//! Prompt construction from worker diagnostics.

use serde::{Deserialize, Serialize};

/// Source excerpt included when the diagnostics point at a known pattern
/// (e.g. a repeating key range implicates the catalog iteration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSnippet {
    pub name: String,
    pub source: String,
}

/// Everything the supervisor knows about a stuck worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub worker_id: u32,
    pub minutes_stuck: u64,
    pub last_upload_at: Option<String>,
    pub shard_key_range: String,
    pub error_patterns: Vec<String>,
    pub disk_util_percent: Option<f32>,
    pub log_excerpt: String,
    #[serde(default)]
    pub code_snippets: Vec<CodeSnippet>,
}

impl Diagnostics {
    /// Stable signature of the failure mode, for response caching.
    pub fn error_signature(&self) -> String {
        let mut parts: Vec<&str> = self.error_patterns.iter().map(String::as_str).collect();
        parts.sort_unstable();
        parts.join("|")
    }
}

pub(crate) const SYSTEM_PROMPT: &str = "You are a systems engineer debugging stalled \
bulk-migration workers. Analyze worker diagnostics and respond with a single JSON object \
and nothing else.";

const MAX_LOG_CHARS: usize = 8_000;

/// Render the user prompt. Log excerpts are bounded so the request stays
/// within endpoint limits.
pub fn build_prompt(diagnostics: &Diagnostics) -> String {
    let mut prompt = format!(
        "Worker {} is stuck: no uploads for {} minutes\nLast upload: {}\nCurrent shard key range: {}\n",
        diagnostics.worker_id,
        diagnostics.minutes_stuck,
        diagnostics.last_upload_at.as_deref().unwrap_or("never"),
        diagnostics.shard_key_range,
    );

    if let Some(util) = diagnostics.disk_util_percent {
        prompt.push_str(&format!("Disk I/O utilization: {util:.1}%\n"));
        if util >= 90.0 {
            prompt.push_str("Disk I/O is saturated; this alone can stall workers.\n");
        }
    }

    if !diagnostics.error_patterns.is_empty() {
        prompt.push_str("\nError patterns detected:\n");
        for pattern in diagnostics.error_patterns.iter().take(10) {
            prompt.push_str(&format!("- {pattern}\n"));
        }
    }

    let excerpt: String = diagnostics
        .log_excerpt
        .chars()
        .rev()
        .take(MAX_LOG_CHARS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    prompt.push_str("\nRecent log lines:\n");
    prompt.push_str(&excerpt);

    for snippet in &diagnostics.code_snippets {
        prompt.push_str(&format!(
            "\n\nRelevant source `{}`:\n```rust\n{}\n```\n",
            snippet.name, snippet.source
        ));
    }

    prompt.push_str(
        "\n\nRespond with JSON containing exactly these fields:\n\
         {\n\
           \"root_cause\": \"<short description>\",\n\
           \"fix_type\": \"restart\" | \"config\" | \"code\" | \"scale_down\",\n\
           \"confidence\": <0.0-1.0>,\n\
           \"description\": \"<what the fix does>\",\n\
           \"params\": { ... } | null,\n\
           \"patch\": { ... } | null\n\
         }\n\
         Use \"scale_down\" when disk saturation is the root cause. For \
         \"config\", put the changed settings in params. For \"code\", put a \
         structured patch in patch.",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_carries_diagnostic_fields() {
        let diagnostics = Diagnostics {
            worker_id: 2,
            minutes_stuck: 7,
            last_upload_at: Some("2026-08-01T10:00:00Z".to_string()),
            shard_key_range: "key > 53213".to_string(),
            error_patterns: vec!["Connection refused".to_string()],
            disk_util_percent: Some(94.2),
            log_excerpt: "last lines".to_string(),
            code_snippets: vec![CodeSnippet {
                name: "next_batch".to_string(),
                source: "fn next_batch() {}".to_string(),
            }],
        };

        let prompt = build_prompt(&diagnostics);
        assert!(prompt.contains("Worker 2 is stuck"));
        assert!(prompt.contains("key > 53213"));
        assert!(prompt.contains("Connection refused"));
        assert!(prompt.contains("94.2%"));
        assert!(prompt.contains("saturated"));
        assert!(prompt.contains("fn next_batch()"));
    }

    #[test]
    fn log_excerpt_is_tail_bounded() {
        let diagnostics = Diagnostics {
            log_excerpt: format!("{}END", "x".repeat(20_000)),
            ..Diagnostics::default()
        };
        let prompt = build_prompt(&diagnostics);
        assert!(prompt.contains("END"));
        assert!(prompt.len() < 12_000);
    }

    #[test]
    fn error_signature_is_order_independent() {
        let a = Diagnostics {
            error_patterns: vec!["b".to_string(), "a".to_string()],
            ..Diagnostics::default()
        };
        let b = Diagnostics {
            error_patterns: vec!["a".to_string(), "b".to_string()],
            ..Diagnostics::default()
        };
        assert_eq!(a.error_signature(), b.error_signature());
    }
}
