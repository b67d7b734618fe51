//! HTTP client for the object-detection inference service.
//!
//! Error mapping drives the retry classifier: transport failures and 5xx
//! responses are transient (`Network`), while 4xx responses and undecodable
//! bodies are fatal (`InvalidInput`); retrying malformed work wastes time.

use std::time::Duration;

use async_trait::async_trait;
use sentinel_core::ports::DetectionClient;
use sentinel_domain::{Detection, JobPayload, Result, SentinelError};
use tracing::debug;

use super::types::{DetectRequest, DetectResponse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a detection service exposing `POST {base_url}/v1/detect`.
pub struct HttpDetectionClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDetectionClient {
    /// Create a client with the default request timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|err| SentinelError::Config(err.to_string()))?;
        Ok(Self { http, base_url: base_url.into() })
    }
}

#[async_trait]
impl DetectionClient for HttpDetectionClient {
    async fn detect(&self, payload: &JobPayload) -> Result<Vec<Detection>> {
        let request = match payload {
            JobPayload::CameraFrame { frame_ref, captured_at } => {
                DetectRequest { frame_ref: frame_ref.clone(), captured_at: *captured_at }
            }
        };

        let response = self
            .http
            .post(format!("{}/v1/detect", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SentinelError::Network(format!(
                "detection service returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(SentinelError::InvalidInput(format!(
                "detection service rejected request with {status}"
            )));
        }

        let body: DetectResponse = response
            .json()
            .await
            .map_err(|err| SentinelError::InvalidInput(format!("undecodable response: {err}")))?;

        debug!(
            frame_ref = %request.frame_ref,
            detections = body.detections.len(),
            "detection call complete"
        );
        Ok(body.detections)
    }
}

fn map_transport_error(err: reqwest::Error) -> SentinelError {
    SentinelError::Network(err.to_string())
}
