//! LLM client scoring detection batches.

use std::time::Duration;

use async_trait::async_trait;
use sentinel_core::ports::AnalysisClient;
use sentinel_domain::{DetectionBatch, Result, RiskAssessment, RiskLevel, SentinelError};
use tracing::{debug, info};

use super::types::{AssessmentDto, ChatCompletionRequest, ChatCompletionResponse, ChatMessage};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Client for a chat-completions style risk analysis endpoint.
pub struct LlmAnalysisClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl LlmAnalysisClient {
    /// Create a client for the given endpoint.
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|err| SentinelError::Config(err.to_string()))?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
        })
    }

    /// Override the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_prompt(batch: &DetectionBatch) -> String {
        let mut prompt = String::from(
            "Assess the security risk of this batch of camera detections.\n\n",
        );
        prompt.push_str(&format!(
            "Source: {}\nDetections: {}\nWindow: {} to {}\nDetection ids: {}\n\n",
            batch.source_id,
            batch.member_ids.len(),
            batch.started_at.to_rfc3339(),
            batch.ended_at.to_rfc3339(),
            batch.member_ids.join(", "),
        ));
        prompt.push_str(
            "Return JSON with: risk_score (integer 0-100), risk_level \
             (low|medium|high|critical), summary, reasoning.",
        );
        prompt
    }

    fn parse_assessment(content: &str) -> Result<RiskAssessment> {
        let dto: AssessmentDto = serde_json::from_str(content)
            .map_err(|err| SentinelError::InvalidInput(format!("unparseable assessment: {err}")))?;

        let risk_score = dto.risk_score.clamp(0, 100) as u8;
        let risk_level = dto
            .risk_level
            .as_deref()
            .and_then(|level| level.parse::<RiskLevel>().ok())
            .unwrap_or_else(|| level_for_score(risk_score));

        Ok(RiskAssessment {
            risk_score,
            risk_level,
            summary: dto.summary,
            reasoning: dto.reasoning,
        })
    }
}

fn level_for_score(score: u8) -> RiskLevel {
    match score {
        0..=24 => RiskLevel::Low,
        25..=49 => RiskLevel::Medium,
        50..=74 => RiskLevel::High,
        _ => RiskLevel::Critical,
    }
}

#[async_trait]
impl AnalysisClient for LlmAnalysisClient {
    async fn assess(&self, batch: &DetectionBatch) -> Result<RiskAssessment> {
        info!(batch_id = %batch.batch_id, members = batch.member_ids.len(), "assessing batch");

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You are a security analyst scoring camera detection batches. \
                              Respond with a single JSON object and nothing else."
                        .to_string(),
                },
                ChatMessage { role: "user".to_string(), content: Self::build_prompt(batch) },
            ],
            temperature: DEFAULT_TEMPERATURE,
        };

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| SentinelError::Network(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(SentinelError::Network(format!("analysis service returned {status}")));
        }
        if !status.is_success() {
            return Err(SentinelError::InvalidInput(format!(
                "analysis service rejected request with {status}"
            )));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| SentinelError::InvalidInput(format!("undecodable response: {err}")))?;

        let content = body
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| SentinelError::InvalidInput("response carried no choices".into()))?;

        let assessment = Self::parse_assessment(content)?;
        debug!(
            batch_id = %batch.batch_id,
            risk_score = assessment.risk_score,
            risk_level = %assessment.risk_level,
            "assessment parsed"
        );
        Ok(assessment)
    }
}
