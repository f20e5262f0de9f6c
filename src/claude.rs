//! Claude messages API client.
//!
//! One seam trait, one HTTP implementation. Both the extractor and the chat
//! route go through [`CompletionClient`] so tests can swap in a scripted
//! model.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::ClaudeConfig;
use crate::google_api::{send_with_retry, RetryPolicy};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("no API key configured (set ANTHROPIC_API_KEY)")]
    MissingApiKey,
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

/// A single-turn completion call.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError>;
}

pub struct ClaudeClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ClaudeClient {
    pub fn new(config: &ClaudeConfig, api_key: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            api_url: config.api_url.clone(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    /// Build a client from config + environment, if a key is present.
    pub fn from_env(config: &ClaudeConfig, timeout: Duration) -> Result<Self, LlmError> {
        let api_key = crate::config::claude_api_key().ok_or(LlmError::MissingApiKey)?;
        Ok(Self::new(config, api_key, timeout))
    }
}

#[async_trait]
impl CompletionClient for ClaudeClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": 0.2,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = send_with_retry(
            self.http
                .post(&self.api_url)
                .header("content-type", "application/json")
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&payload),
            &RetryPolicy::default(),
        )
        .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Shape(e.to_string()))?;
        extract_text(&body)
    }
}

/// Stand-in used when no API key is configured. Every call fails with
/// [`LlmError::MissingApiKey`], which extraction tolerates per batch and the
/// chat route maps to 503.
pub struct UnconfiguredModel;

#[async_trait]
impl CompletionClient for UnconfiguredModel {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::MissingApiKey)
    }
}

/// Pull the assistant text out of a messages-API response body.
fn extract_text(body: &serde_json::Value) -> Result<String, LlmError> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| LlmError::Shape("missing content array".to_string()))?;

    let mut parts = Vec::new();
    for block in blocks {
        if block["type"].as_str() == Some("text") {
            if let Some(text) = block["text"].as_str() {
                parts.push(text);
            }
        }
    }

    if parts.is_empty() {
        return Err(LlmError::Shape("no text blocks in response".to_string()));
    }
    Ok(parts.join("\n"))
}
