//! Downstream service contract (§6, consumed): the transcription and agent services the Worker
//! Pool calls through. Both are treated opaquely — only their failures are inspected, by the
//! Error Classifier.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::classifier::{ClassifiableError, ExceptionKind};

#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
}

impl DownstreamError {
    /// Convert into the classifier's input shape, preserving the distinction between a
    /// transport-level failure (connection/timeout) and an HTTP status the classifier should
    /// pattern-match on.
    pub fn as_classifiable(&self) -> ClassifiableError {
        match self {
            DownstreamError::Connection(msg) => ClassifiableError::new(ExceptionKind::Connection, msg.clone()),
            DownstreamError::Timeout(_) => ClassifiableError::new(ExceptionKind::Timeout, self.to_string()),
            DownstreamError::Http { status, body } => {
                ClassifiableError::new(ExceptionKind::Http { status: *status }, body.clone())
            }
        }
    }
}

/// The transcription service: accepts an audio payload, returns a transcript.
#[async_trait]
pub trait TranscriptionClient: Send + Sync + std::fmt::Debug {
    async fn transcribe(&self, audio_base64: &str) -> Result<String, DownstreamError>;
    async fn health_check(&self) -> bool;
}

/// The agent service: accepts a transcript, returns structured note text.
#[async_trait]
pub trait AgentClient: Send + Sync + std::fmt::Debug {
    async fn generate_note(&self, transcript: &str) -> Result<String, DownstreamError>;
    async fn health_check(&self) -> bool;
}

/// `reqwest`-backed production implementation shared by both client traits — each downstream
/// exposes a single synchronous HTTP operation returning JSON (§6).
#[derive(Debug, Clone)]
pub struct HttpDownstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDownstreamClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is always valid here");
        Self { http, base_url: base_url.into() }
    }

    async fn post_json<Req: serde::Serialize, Res: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Res, DownstreamError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DownstreamError::Timeout(Duration::default())
                } else {
                    DownstreamError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DownstreamError::Http { status: status.as_u16(), body });
        }

        response
            .json()
            .await
            .map_err(|e| DownstreamError::Http { status: status.as_u16(), body: e.to_string() })
    }

    async fn get_health(&self) -> bool {
        self.http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[derive(serde::Serialize)]
struct TranscribeRequest<'a> {
    audio_base64: &'a str,
}

#[derive(serde::Deserialize)]
struct TranscribeResponse {
    transcript: String,
}

#[async_trait]
impl TranscriptionClient for HttpDownstreamClient {
    async fn transcribe(&self, audio_base64: &str) -> Result<String, DownstreamError> {
        let response: TranscribeResponse =
            self.post_json("/transcribe", &TranscribeRequest { audio_base64 }).await?;
        Ok(response.transcript)
    }

    async fn health_check(&self) -> bool {
        self.get_health().await
    }
}

#[derive(serde::Serialize)]
struct NoteRequest<'a> {
    transcript: &'a str,
}

#[derive(serde::Deserialize)]
struct NoteResponse {
    note: String,
}

#[async_trait]
impl AgentClient for HttpDownstreamClient {
    async fn generate_note(&self, transcript: &str) -> Result<String, DownstreamError> {
        let response: NoteResponse = self.post_json("/generate", &NoteRequest { transcript }).await?;
        Ok(response.note)
    }

    async fn health_check(&self) -> bool {
        self.get_health().await
    }
}
