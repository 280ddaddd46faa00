//! Remote extraction agent using OpenAI-compatible APIs
//!
//! Implements the ExtractionAgent trait over HTTP. Supports any
//! OpenAI-compatible endpoint with configurable URL, model, and API key
//! via environment variable.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ExtractorConfig;
use crate::consolidation::ExtractionAgent;
use crate::consolidation::prompts::EXTRACTION_PROMPT;
use crate::consolidation::types::{ExtractionRequest, ExtractionResponse};
use crate::error::{MemoryError, Result};

/// Remote extraction agent using OpenAI-compatible HTTP APIs
#[derive(Debug)]
pub struct RemoteExtractor {
    client: Client,
    config: ExtractorConfig,
    api_key: String,
}

/// OpenAI-compatible chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

/// Message in the chat completion request
#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

/// OpenAI-compatible chat completion response
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

/// Choice in the chat completion response
#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

/// Message in the response choice
#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl RemoteExtractor {
    /// Create a new remote extractor with the given configuration
    ///
    /// Reads the API key from the environment variable named by
    /// config.api_key_env. Returns an error if it is not set.
    pub fn new(config: &ExtractorConfig) -> Result<Self> {
        let api_key = env::var(&config.api_key_env).map_err(|_| {
            MemoryError::Config(format!("API key env var '{}' not set", config.api_key_env))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MemoryError::Extraction(e.to_string()))?;

        info!(
            "RemoteExtractor initialized with model: {}, api_url: {}",
            config.model, config.api_url
        );

        Ok(Self {
            client,
            config: config.clone(),
            api_key,
        })
    }

    /// Call the remote API with exponential backoff for rate limiting
    ///
    /// Makes up to 3 retries with backoff delays of 1s, 2s, 4s on 429
    /// errors. All failures surface as retryable extraction errors; the
    /// pipeline's own attempt accounting decides when to give up.
    async fn call_api(&self, prompt: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: "You extract durable memory from agent session logs.".to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: 0.2,
            max_tokens: 2048,
        };

        let url = format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'));
        debug!("Calling remote API at: {}", url);

        let mut last_error = None;
        let mut delay = Duration::from_secs(1);
        const MAX_RETRIES: u32 = 3;

        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&request)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();

                    if status == 429 {
                        warn!(
                            "Rate limited on attempt {}/{}, waiting {:?}",
                            attempt + 1,
                            MAX_RETRIES,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }

                    if !status.is_success() {
                        let error_text = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        return Err(MemoryError::Extraction(format!(
                            "API returned {status}: {error_text}"
                        )));
                    }

                    let completion: ChatCompletionResponse = response
                        .json()
                        .await
                        .map_err(|e| MemoryError::Extraction(e.to_string()))?;

                    return completion
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| MemoryError::Extraction("Empty response".to_string()));
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    last_error = Some(err_msg.clone());
                    if attempt < MAX_RETRIES - 1 {
                        warn!(
                            "Request failed on attempt {}/{}, retrying: {}",
                            attempt + 1,
                            MAX_RETRIES,
                            err_msg
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(MemoryError::Extraction(format!(
            "Failed after {} retries: {}",
            MAX_RETRIES,
            last_error.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }
}

#[async_trait]
impl ExtractionAgent for RemoteExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractionResponse> {
        let request_json = serde_json::to_string_pretty(request)?;
        let prompt = EXTRACTION_PROMPT.replace("{request}", &request_json);
        let raw = self.call_api(&prompt).await?;
        debug!("Extraction response: {}", raw);

        let response: ExtractionResponse = serde_json::from_str(strip_fences(&raw))
            .map_err(|e| MemoryError::Extraction(format!("malformed extraction JSON: {e}")))?;
        response.validate()?;
        Ok(response)
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Models often wrap JSON in markdown fences despite instructions.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}
