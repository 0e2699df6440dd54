//! HTTP implementation of the target service interface.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Body, Client, StatusCode, multipart};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use super::{
    TargetClient, TargetError, TransferProgress, UploadReceipt, UploadSource, UploadStatus,
};
use crate::fingerprint::Fingerprint;
use crate::metadata::BookMeta;

const EXISTS_ENDPOINT: &str = "api/sources/exists";
const FINGERPRINTS_ENDPOINT: &str = "api/sources/fingerprints";
const UPLOAD_ENDPOINT: &str = "api/upload";
const UPLOAD_REF_ENDPOINT: &str = "api/upload/by-path";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EXISTS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpTargetClient {
    http: Client,
    base_url: Url,
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct ExistsResponse {
    exists: bool,
}

#[derive(Deserialize)]
struct FingerprintLine {
    hash: String,
    size: u64,
}

impl HttpTargetClient {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, TargetError> {
        let parsed = Url::parse(base_url)
            .map_err(|_| TargetError::InvalidBaseUrl(base_url.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(TargetError::InvalidBaseUrl(base_url.to_string()));
        }

        // No global request timeout here: uploads are governed by the
        // caller's watchdog, and the mirror dump is legitimately slow.
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("bookferry/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: parsed,
            username: username.into(),
            password: password.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TargetError> {
        self.base_url
            .join(path)
            .map_err(|_| TargetError::InvalidBaseUrl(format!("{}{}", self.base_url, path)))
    }

    fn meta_payload(meta: &BookMeta) -> serde_json::Value {
        json!({
            "title": meta.title,
            "authors": meta.authors,
            "language": meta.language,
            "series": meta.series,
            "series_index": meta.series_index,
        })
    }

    async fn decode_upload_response(
        response: reqwest::Response,
    ) -> Result<UploadReceipt, TargetError> {
        let status = response.status();
        match status {
            s if s.is_success() => {
                let receipt: UploadReceipt = response.json().await?;
                Ok(receipt)
            }
            // The service reports a known duplicate with 409 on some
            // versions instead of a 200 + duplicate status.
            StatusCode::CONFLICT => Ok(UploadReceipt {
                status: UploadStatus::Duplicate,
                server_fingerprint: None,
            }),
            StatusCode::PAYLOAD_TOO_LARGE => Ok(UploadReceipt {
                status: UploadStatus::SizeRejected,
                server_fingerprint: None,
            }),
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => Ok(UploadReceipt {
                status: UploadStatus::ValidationRejected,
                server_fingerprint: None,
            }),
            other => {
                let body = response.text().await.unwrap_or_default();
                Err(TargetError::UnexpectedStatus {
                    status: other.as_u16(),
                    body: body.chars().take(512).collect(),
                })
            }
        }
    }
}

#[async_trait]
impl TargetClient for HttpTargetClient {
    async fn exists(&self, fp: &Fingerprint) -> Result<bool, TargetError> {
        let mut url = self.endpoint(EXISTS_ENDPOINT)?;
        url.query_pairs_mut()
            .append_pair("hash", &fp.hash)
            .append_pair("size", &fp.size.to_string());

        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(EXISTS_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TargetError::UnexpectedStatus {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let decoded: ExistsResponse = response.json().await?;
        Ok(decoded.exists)
    }

    async fn all_fingerprints(&self) -> Result<HashSet<Fingerprint>, TargetError> {
        let url = self.endpoint(FINGERPRINTS_ENDPOINT)?;
        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TargetError::UnexpectedStatus {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        // The dump is newline-delimited JSON so it can stream; buffer only
        // the current partial line.
        let mut fingerprints = HashSet::new();
        let mut pending = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            pending.extend_from_slice(&chunk);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                decode_fingerprint_line(&line, &mut fingerprints)?;
            }
        }
        decode_fingerprint_line(&pending, &mut fingerprints)?;

        debug!(count = fingerprints.len(), "fetched remote fingerprint set");
        Ok(fingerprints)
    }

    async fn upload(
        &self,
        meta: &BookMeta,
        source: &UploadSource,
        progress: &TransferProgress,
    ) -> Result<UploadReceipt, TargetError> {
        let response = match source {
            UploadSource::PathRef(path) => {
                let url = self.endpoint(UPLOAD_REF_ENDPOINT)?;
                self.http
                    .post(url)
                    .basic_auth(&self.username, Some(&self.password))
                    .json(&json!({
                        "metadata": Self::meta_payload(meta),
                        "source_path": path,
                    }))
                    .send()
                    .await?
            }
            UploadSource::Bytes(path) => {
                let url = self.endpoint(UPLOAD_ENDPOINT)?;
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|source| TargetError::Payload {
                        path: path.clone(),
                        source,
                    })?;
                let length = file
                    .metadata()
                    .await
                    .map_err(|source| TargetError::Payload {
                        path: path.clone(),
                        source,
                    })?
                    .len();

                let counter = progress.clone();
                let stream = ReaderStream::new(file).inspect(move |chunk| {
                    if let Ok(bytes) = chunk {
                        counter.add(bytes.len() as u64);
                    }
                });
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload.bin".to_string());

                let form = multipart::Form::new()
                    .text("metadata", Self::meta_payload(meta).to_string())
                    .part(
                        "file",
                        multipart::Part::stream_with_length(Body::wrap_stream(stream), length)
                            .file_name(file_name),
                    );

                self.http
                    .post(url)
                    .basic_auth(&self.username, Some(&self.password))
                    .multipart(form)
                    .send()
                    .await?
            }
        };

        Self::decode_upload_response(response).await
    }
}

fn decode_fingerprint_line(
    line: &[u8],
    out: &mut HashSet<Fingerprint>,
) -> Result<(), TargetError> {
    let trimmed = std::str::from_utf8(line).unwrap_or("").trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    let decoded: FingerprintLine = serde_json::from_str(trimmed)?;
    out.insert(Fingerprint::new(decoded.hash.to_ascii_lowercase(), decoded.size));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpTargetClient {
        HttpTargetClient::new(&server.uri(), "admin", "secret").expect("client")
    }

    #[tokio::test]
    async fn exists_decodes_json_flag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/sources/exists"))
            .and(query_param("hash", "abc1"))
            .and(query_param("size", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"exists": true})))
            .mount(&server)
            .await;

        let fp = Fingerprint::new("abc1", 42);
        assert!(client(&server).exists(&fp).await.expect("exists"));
    }

    #[tokio::test]
    async fn all_fingerprints_parses_ndjson_stream() {
        let server = MockServer::start().await;
        let body = "{\"hash\":\"aa\",\"size\":1}\n{\"hash\":\"BB\",\"size\":2}\n";
        Mock::given(method("GET"))
            .and(path("/api/sources/fingerprints"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let set = client(&server).all_fingerprints().await.expect("set");
        assert_eq!(set.len(), 2);
        assert!(set.contains(&Fingerprint::new("bb", 2)));
    }

    #[tokio::test]
    async fn upload_conflict_maps_to_duplicate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload/by-path"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let receipt = client(&server)
            .upload(
                &BookMeta::default(),
                &UploadSource::PathRef("/library/x.epub".into()),
                &TransferProgress::new(),
            )
            .await
            .expect("receipt");
        assert_eq!(receipt.status, UploadStatus::Duplicate);
    }

    #[tokio::test]
    async fn upload_5xx_is_transient_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload/by-path"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server)
            .upload(
                &BookMeta::default(),
                &UploadSource::PathRef("/library/x.epub".into()),
                &TransferProgress::new(),
            )
            .await
            .expect_err("error");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn upload_streams_file_and_counts_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "new"})),
            )
            .mount(&server)
            .await;

        let temp = tempfile::TempDir::new().expect("temp dir");
        let file = temp.path().join("book.epub");
        std::fs::write(&file, vec![7u8; 2048]).expect("payload");

        let progress = TransferProgress::new();
        let receipt = client(&server)
            .upload(
                &BookMeta::fallback_for(&file),
                &UploadSource::Bytes(file),
                &progress,
            )
            .await
            .expect("receipt");
        assert_eq!(receipt.status, UploadStatus::New);
        assert_eq!(progress.bytes(), 2048);
    }
}
