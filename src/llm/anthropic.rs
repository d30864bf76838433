use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{LlmProvider, ProviderRequest};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic Messages API client.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    client: Client,
}

impl AnthropicProvider {
    /// Builds a client for `model`.
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Anthropic API key");
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Anthropic HTTP client")?;
        Ok(Self {
            api_key,
            model,
            client,
        })
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn answer(&self, request: &ProviderRequest) -> Result<String> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(self.api_key.trim()).context("invalid Anthropic API key")?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: vec![AnthropicContentBlock {
                    kind: "text",
                    text: request.prompt,
                }],
            }],
        };
        let resp = self
            .client
            .post(MESSAGES_URL)
            .headers(headers)
            .json(&body)
            .send()
            .context("failed to call Anthropic messages API")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("Anthropic returned {}: {}", status, text);
        }
        let parsed: AnthropicResponse =
            resp.json().context("failed to parse Anthropic response")?;
        parsed.into_answer()
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: Vec<AnthropicContentBlock<'a>>,
}

#[derive(Serialize)]
struct AnthropicContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

impl AnthropicResponse {
    fn into_answer(self) -> Result<String> {
        let answer = self
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                AnthropicResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if answer.trim().is_empty() {
            bail!("Anthropic response missing text content");
        }
        Ok(answer.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_text_blocks_and_skips_others() {
        let parsed: AnthropicResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"Dogs bark."},{"type":"tool_use","id":"x","name":"n","input":{}},{"type":"text","text":"Cars drive."}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.into_answer().unwrap(), "Dogs bark.\nCars drive.");
    }

    #[test]
    fn text_free_response_is_an_error() {
        let parsed: AnthropicResponse = serde_json::from_str(r#"{"content":[]}"#).unwrap();
        assert!(parsed.into_answer().is_err());
    }
}
