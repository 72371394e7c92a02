use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// The scheduler's view of the language-model server: a prompt goes in, text
/// comes out. Transport failures surface as errors; no retries happen at this
/// layer — a single failure simply counts against the circuit breaker.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Completion with an attached image, for vision-capable models.
    async fn complete_with_image(&self, prompt: &str, image: &[u8]) -> Result<String>;
}

/// HTTP client for an OpenAI-compatible chat-completions endpoint
/// (Ollama, LM Studio, vLLM, OpenAI, etc.).
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    /// Generate a completion using the OpenAI API format
    pub async fn generate(&self, messages: Vec<Message>) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(0.7),
            max_tokens: Some(1000),
        };

        let mut req = self.client.post(&url).json(&request);

        // API key header is optional; local models don't need one
        if let Some(key) = self.api_key.as_deref() {
            if !key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", key));
            }
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(content)
    }
}

#[async_trait]
impl ModelBackend for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.generate(vec![Message {
            role: "user".to_string(),
            content: prompt.to_string(),
        }])
        .await
    }

    async fn complete_with_image(&self, prompt: &str, image: &[u8]) -> Result<String> {
        let image_base64 = base64::engine::general_purpose::STANDARD.encode(image);
        self.generate(vec![Message {
            role: "user".to_string(),
            content: format!("[IMAGE_BASE64: {}]\n\n{}", image_base64, prompt),
        }])
        .await
    }
}
