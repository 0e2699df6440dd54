//! Durable record of supervisor interventions.
//!
//! The history file is an append-mostly JSON array. It backs three policy
//! decisions: the per-worker attempt cap, cooldown bookkeeping across monitor
//! restarts, and recurring-root-cause detection.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const HISTORY_KEEP: usize = 1_000;
/// Keyword overlap required for two root causes to count as the same issue.
const RECURRENCE_OVERLAP: usize = 3;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to write fix history {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FixType {
    Restart,
    Config,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FixOutcome {
    VerifiedOk,
    NotRecovered,
}

/// One supervisor intervention and its verification result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempt {
    pub worker_id: u32,
    pub ts: DateTime<Utc>,
    pub root_cause: String,
    pub fix_type: FixType,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub diff: Option<String>,
    pub outcome: FixOutcome,
    pub attempt_index: u32,
}

/// File-backed attempt log.
#[derive(Debug)]
pub struct FixHistory {
    path: PathBuf,
    entries: Vec<FixAttempt>,
}

impl FixHistory {
    /// Load the history, tolerating a missing or mangled file.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<FixAttempt>>(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "fix history unreadable; starting fresh");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self { path, entries }
    }

    pub fn entries(&self) -> &[FixAttempt] {
        &self.entries
    }

    /// Append an attempt and persist. The file is rewritten whole (capped at
    /// the most recent entries) through a sibling temp file.
    pub fn record(&mut self, attempt: FixAttempt) -> Result<(), HistoryError> {
        self.entries.push(attempt);
        if self.entries.len() > HISTORY_KEEP {
            let excess = self.entries.len() - HISTORY_KEEP;
            self.entries.drain(..excess);
        }

        let encoded = serde_json::to_vec_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        let write = std::fs::write(&tmp, &encoded)
            .and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(source) = write {
            // Last resort direct write, same as worker progress.
            std::fs::write(&self.path, &encoded).map_err(|source| HistoryError::Write {
                path: self.path.clone(),
                source,
            })?;
            warn!(path = %self.path.display(), error = %source, "atomic history write failed; wrote directly");
        }
        Ok(())
    }

    /// Failed attempts for `worker_id` inside the rolling window, counting
    /// only those after the most recent verified fix.
    pub fn attempts_since_recovery(
        &self,
        worker_id: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> u32 {
        let cutoff = now - window;
        let mut count = 0u32;
        for attempt in &self.entries {
            if attempt.worker_id != worker_id || attempt.ts < cutoff {
                continue;
            }
            match attempt.outcome {
                FixOutcome::VerifiedOk => count = 0,
                FixOutcome::NotRecovered => count += 1,
            }
        }
        count
    }

    /// Timestamp of the latest attempt for `worker_id`, for cooldowns.
    pub fn last_attempt_at(&self, worker_id: u32) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .filter(|attempt| attempt.worker_id == worker_id)
            .map(|attempt| attempt.ts)
            .max()
    }

    /// Whether `root_cause` matches at least two prior attempts by keyword
    /// overlap; a recurring cause biases the recommendation toward a code
    /// fix.
    pub fn is_recurring(&self, worker_id: u32, root_cause: &str) -> bool {
        let keywords = keyword_set(root_cause);
        if keywords.len() < RECURRENCE_OVERLAP {
            return false;
        }
        let matches = self
            .entries
            .iter()
            .filter(|attempt| attempt.worker_id == worker_id)
            .filter(|attempt| {
                keyword_set(&attempt.root_cause)
                    .intersection(&keywords)
                    .count()
                    >= RECURRENCE_OVERLAP
            })
            .count();
        matches >= 2
    }
}

fn keyword_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 2)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn attempt(worker_id: u32, minutes_ago: i64, outcome: FixOutcome, cause: &str) -> FixAttempt {
        FixAttempt {
            worker_id,
            ts: Utc::now() - Duration::minutes(minutes_ago),
            root_cause: cause.to_string(),
            fix_type: FixType::Restart,
            params: None,
            diff: None,
            outcome,
            attempt_index: 0,
        }
    }

    #[test]
    fn record_and_reload_round_trips() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("fix-history.json");

        let mut history = FixHistory::open(&path);
        history
            .record(attempt(1, 0, FixOutcome::NotRecovered, "api 500"))
            .expect("record");

        let reloaded = FixHistory::open(&path);
        assert_eq!(reloaded.entries().len(), 1);
        assert_eq!(reloaded.entries()[0].worker_id, 1);
    }

    #[test]
    fn attempt_count_resets_on_recovery() {
        let temp = TempDir::new().expect("temp dir");
        let mut history = FixHistory::open(temp.path().join("h.json"));
        history
            .record(attempt(1, 50, FixOutcome::NotRecovered, "x"))
            .expect("record");
        history
            .record(attempt(1, 40, FixOutcome::VerifiedOk, "x"))
            .expect("record");
        history
            .record(attempt(1, 10, FixOutcome::NotRecovered, "x"))
            .expect("record");

        let count = history.attempts_since_recovery(1, Duration::minutes(60), Utc::now());
        assert_eq!(count, 1);
    }

    #[test]
    fn attempts_outside_window_are_ignored() {
        let temp = TempDir::new().expect("temp dir");
        let mut history = FixHistory::open(temp.path().join("h.json"));
        history
            .record(attempt(1, 120, FixOutcome::NotRecovered, "x"))
            .expect("record");
        history
            .record(attempt(1, 5, FixOutcome::NotRecovered, "x"))
            .expect("record");

        let count = history.attempts_since_recovery(1, Duration::minutes(60), Utc::now());
        assert_eq!(count, 1);
    }

    #[test]
    fn attempts_are_per_worker() {
        let temp = TempDir::new().expect("temp dir");
        let mut history = FixHistory::open(temp.path().join("h.json"));
        history
            .record(attempt(1, 5, FixOutcome::NotRecovered, "x"))
            .expect("record");
        assert_eq!(
            history.attempts_since_recovery(2, Duration::minutes(60), Utc::now()),
            0
        );
    }

    #[test]
    fn recurrence_requires_two_prior_overlapping_causes() {
        let temp = TempDir::new().expect("temp dir");
        let mut history = FixHistory::open(temp.path().join("h.json"));
        let cause = "database query timeout during batch fetch";

        assert!(!history.is_recurring(1, cause));
        history
            .record(attempt(1, 30, FixOutcome::NotRecovered, cause))
            .expect("record");
        assert!(!history.is_recurring(1, cause));
        history
            .record(attempt(
                1,
                20,
                FixOutcome::NotRecovered,
                "batch fetch hit a database timeout again",
            ))
            .expect("record");
        assert!(history.is_recurring(1, "timeout in database fetch of batch"));
        // Different failure mode does not trip the detector.
        assert!(!history.is_recurring(1, "disk saturated on staging volume"));
    }

    #[test]
    fn unreadable_history_starts_fresh() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("h.json");
        std::fs::write(&path, "{not json").expect("write");
        let history = FixHistory::open(&path);
        assert!(history.entries().is_empty());
    }
}
