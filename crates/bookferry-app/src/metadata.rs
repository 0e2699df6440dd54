//! Metadata extraction through the external ebook tool.
//!
//! The tool prints one `Key: value` line per field; the parser tolerates
//! anything it does not recognize. Extraction is best-effort: the pipeline
//! falls back to a filename-derived record rather than skipping a book over a
//! crashed tool or an unreadable container.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

use crate::text::{SanitizeOptions, sanitize_text_with_options};

/// Target API limits; longer strings are truncated after sanitization.
pub const MAX_TITLE_CHARS: usize = 1024;
pub const MAX_AUTHOR_CHARS: usize = 512;
const MAX_AUTHORS: usize = 20;
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata tool `{tool}` failed to start: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata tool exited with status {status} for {path}")]
    ToolFailed { status: i32, path: PathBuf },
    #[error("metadata tool timed out for {path}")]
    Timeout { path: PathBuf },
}

/// Book metadata carried to the target service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookMeta {
    pub title: String,
    pub authors: Vec<String>,
    pub language: Option<String>,
    pub series: Option<String>,
    pub series_index: Option<f64>,
}

impl BookMeta {
    /// Filename-derived record used whenever extraction fails or yields no
    /// title.
    pub fn fallback_for(path: &Path) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Untitled".to_string());
        Self {
            title: sanitize_title(&stem),
            authors: vec!["Unknown".to_string()],
            language: None,
            series: None,
            series_index: None,
        }
    }

    /// Fill missing fields from another record, preferring existing values.
    pub fn merge_missing_from(&mut self, other: &BookMeta) {
        if self.title.is_empty() && !other.title.is_empty() {
            self.title = other.title.clone();
        }
        if self.authors.is_empty() {
            self.authors = other.authors.clone();
        }
        if self.language.is_none() {
            self.language = other.language.clone();
        }
        if self.series.is_none() {
            self.series = other.series.clone();
            self.series_index = other.series_index;
        }
    }
}

/// Extractor invoking the external tool (`ebook-meta` by default).
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    tool: PathBuf,
}

impl MetadataExtractor {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    /// Extract metadata, falling back to a filename-derived record on any
    /// failure. This never returns an error to the caller; the failure is
    /// logged at warn.
    pub async fn extract_or_fallback(&self, path: &Path) -> BookMeta {
        match self.extract(path).await {
            Ok(meta) if !meta.title.is_empty() => meta,
            Ok(mut meta) => {
                meta.merge_missing_from(&BookMeta::fallback_for(path));
                meta
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "metadata extraction failed; using filename fallback");
                BookMeta::fallback_for(path)
            }
        }
    }

    /// Run the tool and parse its output.
    pub async fn extract(&self, path: &Path) -> Result<BookMeta, MetadataError> {
        let child = Command::new(&self.tool)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(EXTRACT_TIMEOUT, child)
            .await
            .map_err(|_| MetadataError::Timeout {
                path: path.to_path_buf(),
            })?
            .map_err(|source| MetadataError::Spawn {
                tool: self.tool.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(MetadataError::ToolFailed {
                status: output.status.code().unwrap_or(-1),
                path: path.to_path_buf(),
            });
        }

        Ok(parse_tool_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `Key: value` lines emitted by the ebook tool.
pub fn parse_tool_output(output: &str) -> BookMeta {
    let mut meta = BookMeta::default();

    for line in output.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "Title" => meta.title = sanitize_title(value),
            "Author(s)" => {
                meta.authors = value
                    .split('&')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .take(MAX_AUTHORS)
                    .map(sanitize_author)
                    .collect();
            }
            "Language" | "Languages" => {
                meta.language = Some(normalize_language(value));
            }
            "Series" => meta.series = Some(sanitize_author(value)),
            "Series Index" => meta.series_index = value.parse::<f64>().ok(),
            _ => {}
        }
    }

    meta
}

fn sanitize_title(raw: &str) -> String {
    sanitize_text_with_options(
        raw,
        SanitizeOptions {
            max_chars: Some(MAX_TITLE_CHARS),
            collapse_whitespace: true,
        },
    )
}

fn sanitize_author(raw: &str) -> String {
    sanitize_text_with_options(
        raw,
        SanitizeOptions {
            max_chars: Some(MAX_AUTHOR_CHARS),
            collapse_whitespace: true,
        },
    )
}

/// Normalize a language tag to ISO-639-1. Legacy three-letter codes map to
/// the shortest equivalent; already-short or unrecognized tags pass through
/// lowercased.
pub fn normalize_language(raw: &str) -> String {
    let tag = raw
        .split(&[',', ';'][..])
        .next()
        .unwrap_or(raw)
        .trim()
        .to_ascii_lowercase();

    let mapped = match tag.as_str() {
        "rus" => "ru",
        "eng" => "en",
        "ger" | "deu" => "de",
        "fre" | "fra" => "fr",
        "spa" => "es",
        "ita" => "it",
        "pol" => "pl",
        "ukr" => "uk",
        "jpn" => "ja",
        "chi" | "zho" => "zh",
        "por" => "pt",
        "dut" | "nld" => "nl",
        "cze" | "ces" => "cs",
        "swe" => "sv",
        "nor" => "no",
        "fin" => "fi",
        "hun" => "hu",
        "tur" => "tr",
        "ara" => "ar",
        "heb" => "he",
        "kor" => "ko",
        "lat" => "la",
        other => other,
    };
    mapped.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOL_OUTPUT: &str = "\
Title               : The Glass Bead Game
Author(s)           : Hermann Hesse & Richard Winston [translator]
Publisher           : Picador
Language            : ger
Series              : Magister Ludi
Series Index        : 1.0
";

    #[test]
    fn parses_tool_output_fields() {
        let meta = parse_tool_output(TOOL_OUTPUT);
        assert_eq!(meta.title, "The Glass Bead Game");
        assert_eq!(
            meta.authors,
            vec!["Hermann Hesse", "Richard Winston [translator]"]
        );
        assert_eq!(meta.language.as_deref(), Some("de"));
        assert_eq!(meta.series.as_deref(), Some("Magister Ludi"));
        assert_eq!(meta.series_index, Some(1.0));
    }

    #[test]
    fn legacy_language_codes_take_shortest_equivalent() {
        assert_eq!(normalize_language("rus"), "ru");
        assert_eq!(normalize_language("ZHO"), "zh");
        assert_eq!(normalize_language("en"), "en");
        assert_eq!(normalize_language("xyz"), "xyz");
    }

    #[test]
    fn author_list_is_bounded() {
        let authors = (0..40)
            .map(|i| format!("Author {i}"))
            .collect::<Vec<_>>()
            .join(" & ");
        let meta = parse_tool_output(&format!("Author(s) : {authors}\n"));
        assert_eq!(meta.authors.len(), 20);
    }

    #[test]
    fn title_is_sanitized_and_truncated() {
        let long = "x".repeat(MAX_TITLE_CHARS + 50);
        let meta = parse_tool_output(&format!("Title : {long}\u{0000}\n"));
        assert_eq!(meta.title.chars().count(), MAX_TITLE_CHARS);
        assert!(!meta.title.contains('\0'));
    }

    #[test]
    fn fallback_uses_file_stem_and_unknown_author() {
        let meta = BookMeta::fallback_for(Path::new("/library/Borges - Ficciones.epub"));
        assert_eq!(meta.title, "Borges - Ficciones");
        assert_eq!(meta.authors, vec!["Unknown"]);
    }

    #[test]
    fn merge_prefers_existing_values() {
        let mut meta = parse_tool_output("Title : Kept\n");
        let other = parse_tool_output("Title : Discarded\nLanguage : pol\n");
        meta.merge_missing_from(&other);
        assert_eq!(meta.title, "Kept");
        assert_eq!(meta.language.as_deref(), Some("pl"));
    }
}
