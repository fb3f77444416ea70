use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::correlator::CorrelationKey;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("audio url cannot be empty")]
    EmptyAudioUrl,
    #[error("invalid scoring endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("error sending request to scoring service: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("scoring service returned non-OK status: {0}")]
    Status(u16),
    #[error("scoring service reported: {0}")]
    Remote(String),
    #[error("scoring service returned a non-finite score")]
    InvalidScore,
    #[error("scoring timed out after {0:?}")]
    Timeout(Duration),
    #[error("scoring cancelled")]
    Cancelled,
    #[error("scoring queue is full")]
    QueueFull,
    #[error("scoring queue is closed")]
    Closed,
    #[error("correlation key {0} is already in flight")]
    DuplicateKey(CorrelationKey),
}

/// Remote pipeline that turns one recording into a score.
///
/// Implementations may be slow and may fail; callers supply their own
/// timeout.
#[async_trait]
pub trait ScoringClient: Send + Sync {
    async fn score_audio(&self, audio_url: &str, song_id: &str) -> Result<f64, ScoringError>;
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    audio_url: &'a str,
    song_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    #[serde(default)]
    score: f64,
    #[serde(default)]
    error: Option<String>,
}

/// Talks to the scoring service over HTTP: `POST {base}/score`.
#[derive(Debug, Clone)]
pub struct HttpScoringClient {
    endpoint: Url,
    http: Client,
}

impl HttpScoringClient {
    pub fn new(base_url: &str) -> Result<Self, ScoringError> {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: &str, http: Client) -> Result<Self, ScoringError> {
        let base = format!("{}/", base_url.trim().trim_end_matches('/'));
        let endpoint = Url::parse(&base)?.join("score")?;
        Ok(Self { endpoint, http })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ScoringClient for HttpScoringClient {
    async fn score_audio(&self, audio_url: &str, song_id: &str) -> Result<f64, ScoringError> {
        if audio_url.trim().is_empty() {
            return Err(ScoringError::EmptyAudioUrl);
        }

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&ScoreRequest { audio_url, song_id })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ScoringError::Status(status.as_u16()));
        }

        let body: ScoreResponse = response.json().await?;
        if let Some(error) = body.error.filter(|error| !error.is_empty()) {
            return Err(ScoringError::Remote(error));
        }
        Ok(body.score)
    }
}
