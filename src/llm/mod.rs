//! Chat-completion backends used to phrase the final answer.

use anyhow::Result;

mod anthropic;
mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::{OpenAiCompatibleProvider, DEFAULT_HF_ROUTER_BASE, DEFAULT_HF_ROUTER_MODEL};

/// Trait implemented by concrete LLM providers.
pub trait LlmProvider: Send + Sync {
    /// Short label used in logs, e.g. `openai-compatible`.
    fn name(&self) -> &str;

    /// Sends one request and returns the generated text, trimmed.
    fn answer(&self, request: &ProviderRequest) -> Result<String>;
}

/// Request envelope shared by the various providers.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    /// System instruction.
    pub system: &'a str,
    /// User turn carrying context and question.
    pub prompt: &'a str,
    /// Sampling temperature; provider default when unset.
    pub temperature: Option<f32>,
    /// Completion token cap.
    pub max_tokens: usize,
}
