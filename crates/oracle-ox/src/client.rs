//! HTTP client for the chat-completion endpoint.

use std::time::Duration;

use bon::bon;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::prompt::{Diagnostics, SYSTEM_PROMPT, build_prompt};
use crate::response::{Advice, parse_advice};

const COMPLETIONS_PATH: &str = "v1/chat/completions";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_TOKENS: u32 = 1_500;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("invalid oracle base url `{0}`")]
    InvalidBaseUrl(String),
    #[error("oracle request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oracle returned status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("oracle response carried no content")]
    MissingContent,
}

/// Thin, advisory-only client. One call per analysis; caching is the
/// caller's concern.
#[derive(Debug, Clone)]
pub struct OracleClient {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[bon]
impl OracleClient {
    #[builder]
    pub fn new(
        base_url: &str,
        api_key: String,
        model: Option<String>,
        max_tokens: Option<u32>,
    ) -> Result<Self, OracleError> {
        let parsed =
            Url::parse(base_url).map_err(|_| OracleError::InvalidBaseUrl(base_url.to_string()))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(OracleError::Http)?;
        Ok(Self {
            http,
            base_url: parsed,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        })
    }

    /// Analyze one stuck worker. Network or endpoint failures surface as
    /// errors; a reachable endpoint that answers nonsense still yields the
    /// restart fallback via [`parse_advice`].
    pub async fn analyze(&self, diagnostics: &Diagnostics) -> Result<Advice, OracleError> {
        let url = self
            .base_url
            .join(COMPLETIONS_PATH)
            .map_err(|_| OracleError::InvalidBaseUrl(self.base_url.to_string()))?;

        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": 0.1,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_prompt(diagnostics)},
            ],
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OracleError::UnexpectedStatus {
                status: response.status().as_u16(),
                body: response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(512)
                    .collect(),
            });
        }

        let decoded: CompletionResponse = response.json().await?;
        let content = decoded
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(OracleError::MissingContent)?;

        Ok(parse_advice(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::FixKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn diagnostics() -> Diagnostics {
        Diagnostics {
            worker_id: 1,
            minutes_stuck: 6,
            shard_key_range: "key > 100".to_string(),
            ..Diagnostics::default()
        }
    }

    #[tokio::test]
    async fn analyze_round_trips_structured_advice() {
        let server = MockServer::start().await;
        let payload = serde_json::json!({
            "choices": [{"message": {"content":
                "{\"root_cause\": \"api 500s\", \"fix_type\": \"config\", \"confidence\": 0.8, \"params\": {\"parallel_uploads\": 1}}"
            }}]
        });
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload))
            .mount(&server)
            .await;

        let client = OracleClient::builder()
            .base_url(&server.uri())
            .api_key("sk-test".to_string())
            .build()
            .expect("client");
        let advice = client.analyze(&diagnostics()).await.expect("advice");
        assert_eq!(advice.fix_type, FixKind::Config);
        assert_eq!(advice.root_cause, "api 500s");
    }

    #[tokio::test]
    async fn unparseable_content_degrades_to_restart() {
        let server = MockServer::start().await;
        let payload = serde_json::json!({
            "choices": [{"message": {"content": "it is probably haunted"}}]
        });
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload))
            .mount(&server)
            .await;

        let client = OracleClient::builder()
            .base_url(&server.uri())
            .api_key("sk-test".to_string())
            .build()
            .expect("client");
        let advice = client.analyze(&diagnostics()).await.expect("advice");
        assert_eq!(advice.fix_type, FixKind::Restart);
        assert!((advice.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn endpoint_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = OracleClient::builder()
            .base_url(&server.uri())
            .api_key("sk-test".to_string())
            .build()
            .expect("client");
        let err = client.analyze(&diagnostics()).await.expect_err("error");
        assert!(matches!(err, OracleError::UnexpectedStatus { status: 429, .. }));
    }
}
