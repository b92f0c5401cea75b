use std::time::{Duration, Instant};

use axum::http::StatusCode;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::completion::CompletionRequest;
use crate::config::Config;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CLIENT_TITLE: &str = "AI Voice-to-Notes";

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("OPENROUTER_API_KEY is not configured in backend environment")]
    MissingApiKey,
    #[error("OpenRouter API error: {body}")]
    Upstream { status: StatusCode, body: String },
    #[error("OpenRouter request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("OpenRouter returned an unreadable response: {0}")]
    InvalidResponse(String),
    #[error("OpenRouter returned empty response")]
    EmptyResponse,
}

/// Client for an OpenAI compatible chat completions endpoint
#[derive(Clone, Debug)]
pub struct CompletionClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    referer: String,
}

#[derive(Serialize, Debug)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Debug)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize, Debug, Default)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug, Default)]
struct Choice {
    #[serde(default)]
    message: ResponseMessage,
}

#[derive(Deserialize, Debug, Default)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl CompletionClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        referer: impl Into<String>,
    ) -> Result<Self, CompletionError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.filter(|key| !key.is_empty()),
            referer: referer.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, CompletionError> {
        Self::new(
            &config.openrouter_base_url,
            config.api_key().map(String::from),
            config.referer(),
        )
    }

    /// Runs one chat completion and returns the trimmed text of the first choice.
    ///
    /// Nothing is retried. A missing API key fails before any request is sent.
    #[tracing::instrument(
        level = "info",
        skip(self, request),
        fields(model = %request.model, max_tokens = request.max_tokens)
    )]
    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let api_key = self.api_key.as_deref().ok_or(CompletionError::MissingApiKey)?;

        let payload = ChatCompletionRequest {
            model: &request.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", CLIENT_TITLE)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "completion API returned an error");
            return Err(CompletionError::Upstream { status, body });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(CompletionError::EmptyResponse);
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = content.len(),
            "completion finished"
        );
        Ok(content)
    }
}
