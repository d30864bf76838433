use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{LlmProvider, ProviderRequest};

/// OpenAI-compatible base of the Hugging Face inference router.
pub const DEFAULT_HF_ROUTER_BASE: &str = "https://router.huggingface.co/v1";
/// Instruction-tuned model served through the router by default.
pub const DEFAULT_HF_ROUTER_MODEL: &str = "mistralai/Mistral-7B-Instruct-v0.2";

/// `/chat/completions` client for OpenAI and any server speaking its API,
/// including the Hugging Face router.
pub struct OpenAiCompatibleProvider {
    api_key: String,
    model: String,
    endpoint: String,
    client: Client,
}

impl OpenAiCompatibleProvider {
    /// Builds a client posting to `{base_url}/chat/completions`.
    pub fn new(api_key: String, base_url: &str, model: String, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing chat completion API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing chat completion model");
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build chat completion HTTP client")?;
        Ok(Self {
            api_key,
            model,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            client,
        })
    }
}

impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn answer(&self, request: &ProviderRequest) -> Result<String> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", self.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid chat completion API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = ChatRequest::new(&self.model, request);
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .with_context(|| format!("failed to call {}", self.endpoint))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("chat completion returned {}: {}", status, text);
        }
        let parsed: ChatResponse = resp
            .json()
            .context("failed to parse chat completion response")?;
        parsed.into_answer()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

impl<'a> ChatRequest<'a> {
    fn new(model: &'a str, request: &ProviderRequest<'a>) -> Self {
        Self {
            model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: request.system,
                },
                ChatMessage {
                    role: "user",
                    content: request.prompt,
                },
            ],
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatResponse {
    fn into_answer(self) -> Result<String> {
        let Some(choice) = self.choices.into_iter().next() else {
            bail!("chat completion returned no choices");
        };
        Ok(choice.message.content.unwrap_or_default().trim().to_string())
    }
}
