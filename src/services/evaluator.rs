use crate::config::EvaluatorConfig;
use crate::error::{AppError, Result};
use crate::models::session::Summary;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 256;

/// The single seam to the external language model:
/// `(prompt, code) -> {progress, feedback}`.
#[async_trait]
pub trait Evaluate: Send + Sync {
    async fn evaluate(&self, prompt: &str, code: &str) -> Result<Summary>;
}

/// HTTP client for an Anthropic-style messages endpoint. The model is
/// forced into a fixed schema; anything that does not satisfy it
/// collapses to the default summary.
pub struct LmEvaluator {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    rate_limit_backoff: Duration,
}

impl LmEvaluator {
    pub fn new(config: &EvaluatorConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            rate_limit_backoff: Duration::from_secs(config.rate_limit_backoff_seconds),
        }
    }

    async fn send_request(&self, instruction: &str) -> Result<EvaluatorResponse> {
        let body = CreateMessageRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            messages: vec![Message {
                role: "user".to_string(),
                content: instruction.to_string(),
            }],
        };

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::EvaluatorUnavailable(format!("request failed: {}", e)))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Ok(EvaluatorResponse::RateLimited);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            return Err(AppError::EvaluatorUnavailable(format!(
                "HTTP {}: {}",
                status, body_text
            )));
        }

        let parsed: CreateMessageResponse = response
            .json()
            .await
            .map_err(|e| AppError::EvaluatorUnavailable(format!("malformed response: {}", e)))?;

        let text = parsed
            .content
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
            })
            .unwrap_or_default();

        Ok(EvaluatorResponse::Text(text))
    }
}

enum EvaluatorResponse {
    Text(String),
    RateLimited,
}

#[async_trait]
impl Evaluate for LmEvaluator {
    async fn evaluate(&self, prompt: &str, code: &str) -> Result<Summary> {
        let instruction = build_instruction(prompt, code);

        match self.send_request(&instruction).await? {
            EvaluatorResponse::Text(text) => Ok(parse_summary(&text).unwrap_or_else(|| {
                warn!("evaluator response did not satisfy the schema, using default");
                Summary::default_not_started()
            })),
            EvaluatorResponse::RateLimited => {
                // Back off once, then settle for the default.
                warn!(
                    "evaluator rate-limited, retrying in {:?}",
                    self.rate_limit_backoff
                );
                tokio::time::sleep(self.rate_limit_backoff).await;
                match self.send_request(&instruction).await? {
                    EvaluatorResponse::Text(text) => Ok(parse_summary(&text)
                        .unwrap_or_else(Summary::default_not_started)),
                    EvaluatorResponse::RateLimited => Ok(Summary::default_not_started()),
                }
            }
        }
    }
}

fn build_instruction(prompt: &str, code: &str) -> String {
    format!(
        "You are grading a student's in-progress answer to a classroom coding task.\n\
         Task prompt:\n{}\n\nStudent code:\n{}\n\n\
         Reply with a single JSON object and nothing else, of the shape\n\
         {{\"progress\": <label>, \"feedback\": <string>}}\n\
         where <label> is exactly one of \"notStarted\", \"justStarted\", \
         \"halfwayDone\", \"almostDone\", \"allDone\" and feedback is a \
         20-30 word hint addressed to the student.",
        prompt, code
    )
}

/// Extracts and validates the forced-choice schema from the model's
/// reply. Tolerates fenced code blocks and leading prose; anything else
/// is a schema miss.
fn parse_summary(text: &str) -> Option<Summary> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let summary: Summary = serde_json::from_str(&text[start..=end]).ok()?;
    if summary.feedback.trim().is_empty() {
        return None;
    }
    Some(summary)
}

#[derive(Serialize)]
struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct CreateMessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}
