//! Generation collaborator abstraction and implementations.
//!
//! The engine consumes text generation through the [`Generator`] trait:
//! `generate(prompt, options) -> text`. Retrieval-grounded answers use
//! temperature 0.0; the generation fallback uses the configured
//! (typically non-zero) temperature.
//!
//! Concrete implementations mirror the embedding collaborators: OpenAI
//! chat completions and Ollama `/api/generate`, with the same retry
//! discipline. Generation is optional — when the provider is `disabled`,
//! [`create_generator`] returns `None` and the router falls through to
//! its no-answer outcome.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Trait for generation collaborators.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String>;
}

/// Create the configured [`Generator`], or `None` when disabled.
pub fn create_generator(config: &GenerationConfig) -> Result<Option<Arc<dyn Generator>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiGenerator::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaGenerator::new(config)?))),
        other => bail!("Unknown generation provider: {}", other),
    }
}

fn required_model(config: &GenerationConfig) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("generation.model required"))
}

// ============ OpenAI ============

/// Generation collaborator backed by the OpenAI chat completions API.
pub struct OpenAiGenerator {
    model: String,
    api_key: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: required_model(config)?,
            api_key,
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });

        let request = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body);

        let json =
            crate::embedding::post_json_with_retry(request, self.max_retries, "OpenAI chat")
                .await?;

        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(|t| t.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
    }
}

// ============ Ollama ============

/// Generation collaborator backed by a local Ollama instance.
pub struct OllamaGenerator {
    model: String,
    url: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: required_model(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "num_predict": options.max_tokens,
            },
        });

        let request = self
            .client
            .post(format!("{}/api/generate", self.url))
            .header("Content-Type", "application/json")
            .json(&body);

        let json =
            crate::embedding::post_json_with_retry(request, self.max_retries, "Ollama generate")
                .await?;

        json.get("response")
            .and_then(|t| t.as_str())
            .map(|t| t.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response field"))
    }
}
