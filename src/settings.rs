//! Command-line flag groups shared by the binaries.
//!
//! Every flag can also come from the environment; secrets only ever do in
//! practice.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::info;

use crate::embedder::{
    Embedder, HuggingFaceEmbedder, OpenAiEmbedder, DEFAULT_EMBED_MODEL, DEFAULT_HF_INFERENCE_BASE,
};
use crate::llm::{
    AnthropicProvider, LlmProvider, OpenAiCompatibleProvider, DEFAULT_HF_ROUTER_BASE,
    DEFAULT_HF_ROUTER_MODEL,
};
use crate::pipeline::{ArtifactPaths, LoadedArtifacts};
use crate::query::{QueryService, QuerySettings};

const OPENAI_BASE: &str = "https://api.openai.com/v1";
const OPENAI_EMBED_MODEL: &str = "text-embedding-3-small";
const OPENAI_CHAT_MODEL: &str = "gpt-4o-mini";
const ANTHROPIC_CHAT_MODEL: &str = "claude-3-sonnet-20240229";

/// API credentials, read once and shared by the embedder and LLM groups.
#[derive(Args, Debug, Clone, Default)]
pub struct CredentialArgs {
    /// Hugging Face token for inference and the router
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Anthropic API key
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,
}

/// Embedding backends.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedProvider {
    /// Hugging Face Inference feature-extraction
    Huggingface,
    /// OpenAI-compatible `/embeddings`
    Openai,
}

/// Embedding backend selection and tuning.
#[derive(Args, Debug, Clone)]
pub struct EmbedderArgs {
    /// Embedding backend
    #[arg(long, env = "WIKIRAG_EMBED_PROVIDER", value_enum, default_value_t = EmbedProvider::Huggingface)]
    pub embed_provider: EmbedProvider,

    /// Embedding model id (defaults per backend)
    #[arg(long, env = "WIKIRAG_EMBED_MODEL")]
    pub embed_model: Option<String>,

    /// Base URL of the Hugging Face inference provider
    #[arg(long, env = "WIKIRAG_HF_INFERENCE_BASE", default_value = DEFAULT_HF_INFERENCE_BASE)]
    pub hf_inference_base: String,

    /// Base URL for the OpenAI-compatible embeddings API
    #[arg(long, env = "WIKIRAG_OPENAI_BASE", default_value = OPENAI_BASE)]
    pub openai_base_url: String,

    /// Optional dimension override for OpenAI models that support it
    #[arg(long, env = "WIKIRAG_EMBED_DIMENSIONS")]
    pub embed_dimensions: Option<usize>,

    /// Texts per embedding request
    #[arg(long, env = "WIKIRAG_EMBED_BATCH", default_value_t = 32)]
    pub embed_batch_size: usize,

    /// Embedding request timeout in seconds
    #[arg(long, env = "WIKIRAG_EMBED_TIMEOUT_SECS", default_value_t = 60)]
    pub embed_timeout_secs: u64,

    /// Attempts per embedding request before giving up
    #[arg(long, env = "WIKIRAG_EMBED_MAX_RETRIES", default_value_t = 5)]
    pub embed_max_retries: usize,
}

impl EmbedderArgs {
    /// Model id after applying the per-backend default.
    pub fn model(&self) -> &str {
        match (&self.embed_model, self.embed_provider) {
            (Some(model), _) => model.as_str(),
            (None, EmbedProvider::Huggingface) => DEFAULT_EMBED_MODEL,
            (None, EmbedProvider::Openai) => OPENAI_EMBED_MODEL,
        }
    }

    /// Builds the configured embedder.
    pub fn build(&self, credentials: &CredentialArgs) -> Result<Arc<dyn Embedder>> {
        let timeout = Duration::from_secs(self.embed_timeout_secs);
        let embedder: Arc<dyn Embedder> = match self.embed_provider {
            EmbedProvider::Huggingface => Arc::new(HuggingFaceEmbedder::new(
                credentials.hf_token.as_deref(),
                &self.hf_inference_base,
                self.model().to_string(),
                timeout,
                self.embed_max_retries,
                self.embed_batch_size,
            )?),
            EmbedProvider::Openai => {
                let api_key = credentials
                    .openai_api_key
                    .as_deref()
                    .context("OPENAI_API_KEY is required for the openai embedder")?;
                Arc::new(OpenAiEmbedder::new(
                    api_key,
                    &self.openai_base_url,
                    self.model().to_string(),
                    self.embed_dimensions,
                    timeout,
                    self.embed_max_retries,
                    self.embed_batch_size,
                )?)
            }
        };
        Ok(embedder)
    }
}

/// Chat completion backends.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    /// Hugging Face router (OpenAI-compatible)
    Huggingface,
    /// OpenAI chat completions
    Openai,
    /// Anthropic messages
    Anthropic,
}

/// Generation backend selection and prompt limits.
#[derive(Args, Debug, Clone)]
pub struct LlmArgs {
    /// Chat completion backend
    #[arg(long, env = "WIKIRAG_LLM_PROVIDER", value_enum, default_value_t = LlmBackend::Huggingface)]
    pub llm_provider: LlmBackend,

    /// Chat model id (defaults per backend)
    #[arg(long, env = "WIKIRAG_LLM_MODEL")]
    pub llm_model: Option<String>,

    /// Override the OpenAI-compatible base URL
    #[arg(long, env = "WIKIRAG_LLM_BASE_URL")]
    pub llm_base_url: Option<String>,

    /// Completion token cap
    #[arg(long, env = "WIKIRAG_LLM_MAX_TOKENS", default_value_t = 120)]
    pub max_completion_tokens: usize,

    /// Sampling temperature (provider default when unset)
    #[arg(long, env = "WIKIRAG_LLM_TEMPERATURE")]
    pub temperature: Option<f32>,

    /// Generation request timeout in seconds
    #[arg(long, env = "WIKIRAG_LLM_TIMEOUT_SECS", default_value_t = 60)]
    pub llm_timeout_secs: u64,

    /// Characters kept from each passage in the prompt
    #[arg(long, env = "WIKIRAG_MAX_PASSAGE_CHARS", default_value_t = 800)]
    pub max_passage_chars: usize,

    /// Upper bound on the prompt context block, in characters
    #[arg(long, env = "WIKIRAG_MAX_CONTEXT_CHARS", default_value_t = 6000)]
    pub max_context_chars: usize,
}

impl LlmArgs {
    /// Model id after applying the per-backend default.
    pub fn model(&self) -> &str {
        match (&self.llm_model, self.llm_provider) {
            (Some(model), _) => model.as_str(),
            (None, LlmBackend::Huggingface) => DEFAULT_HF_ROUTER_MODEL,
            (None, LlmBackend::Openai) => OPENAI_CHAT_MODEL,
            (None, LlmBackend::Anthropic) => ANTHROPIC_CHAT_MODEL,
        }
    }

    /// Builds the configured provider.
    pub fn build(&self, credentials: &CredentialArgs) -> Result<Arc<dyn LlmProvider>> {
        let timeout = Duration::from_secs(self.llm_timeout_secs);
        let model = self.model().to_string();
        let provider: Arc<dyn LlmProvider> = match self.llm_provider {
            LlmBackend::Huggingface => {
                let token = credentials
                    .hf_token
                    .clone()
                    .context("HF_TOKEN is required for the Hugging Face router")?;
                let base = self.llm_base_url.as_deref().unwrap_or(DEFAULT_HF_ROUTER_BASE);
                Arc::new(OpenAiCompatibleProvider::new(token, base, model, timeout)?)
            }
            LlmBackend::Openai => {
                let key = credentials
                    .openai_api_key
                    .clone()
                    .context("OPENAI_API_KEY is required for the openai provider")?;
                let base = self.llm_base_url.as_deref().unwrap_or(OPENAI_BASE);
                Arc::new(OpenAiCompatibleProvider::new(key, base, model, timeout)?)
            }
            LlmBackend::Anthropic => {
                let key = credentials
                    .anthropic_api_key
                    .clone()
                    .context("ANTHROPIC_API_KEY is required for the anthropic provider")?;
                Arc::new(AnthropicProvider::new(key, model, timeout)?)
            }
        };
        Ok(provider)
    }

    /// Prompt and generation limits for the query service.
    pub fn query_settings(&self) -> QuerySettings {
        QuerySettings {
            max_passage_chars: self.max_passage_chars,
            max_context_chars: self.max_context_chars,
            max_completion_tokens: self.max_completion_tokens,
            temperature: self.temperature,
        }
    }
}

/// Everything a query-answering binary needs to stand up a [`QueryService`].
#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Directory holding metadata.parquet, wiki_index.faiss and manifest.json
    #[arg(long, env = "WIKIRAG_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Accept an embedding model that differs from the one in the manifest
    #[arg(long, env = "WIKIRAG_ALLOW_MODEL_MISMATCH", default_value_t = false)]
    pub allow_model_mismatch: bool,

    /// API tokens for the hosted backends.
    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Query embedder; must match the one the index was built with.
    #[command(flatten)]
    pub embedder: EmbedderArgs,

    /// Answer generation backend.
    #[command(flatten)]
    pub llm: LlmArgs,
}

impl ServiceArgs {
    /// Builds the configured LLM provider.
    pub fn build_provider(&self) -> Result<Arc<dyn LlmProvider>> {
        self.llm.build(&self.credentials)
    }

    /// Loads the artifacts, checks them against the embedder and probes it.
    ///
    /// Every failure here is a startup failure.
    pub fn load_service(&self, provider: Arc<dyn LlmProvider>) -> Result<QueryService> {
        let paths = ArtifactPaths::in_dir(&self.data_dir);
        let artifacts = LoadedArtifacts::load(&paths)
            .with_context(|| format!("failed to load artifacts from {:?}", self.data_dir))?;
        let embedder = self.embedder.build(&self.credentials)?;
        artifacts.check_model(embedder.model_id(), self.allow_model_mismatch)?;
        let service = QueryService::new(artifacts, embedder, provider, self.llm.query_settings())?;
        service.probe_embedder()?;
        info!(
            chunks = service.chunk_count(),
            embed_model = self.embedder.model(),
            llm_model = self.llm.model(),
            "query service ready"
        );
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, FromArgMatches, Parser};
    use pretty_assertions::assert_eq;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        credentials: CredentialArgs,
        #[command(flatten)]
        embedder: EmbedderArgs,
        #[command(flatten)]
        llm: LlmArgs,
    }

    impl TestCli {
        /// Parses `args` with every env fallback detached, so exported
        /// `WIKIRAG_*` or token variables cannot leak into the assertions.
        fn parse_args<const N: usize>(args: [&str; N]) -> Self {
            let matches = Self::command()
                .mut_args(|arg| arg.env(None::<&'static str>))
                .try_get_matches_from(args)
                .unwrap();
            Self::from_arg_matches(&matches).unwrap()
        }
    }

    #[test]
    fn env_fallbacks_are_detached() {
        let command = TestCli::command().mut_args(|arg| arg.env(None::<&'static str>));
        assert!(command.get_arguments().all(|arg| arg.get_env().is_none()));
        assert!(TestCli::command()
            .get_arguments()
            .any(|arg| arg.get_env().is_some_and(|name| name == "HF_TOKEN")));
    }

    #[test]
    fn defaults_follow_backend() {
        let cli = TestCli::parse_args(["test"]);
        assert_eq!(cli.embedder.model(), DEFAULT_EMBED_MODEL);
        assert_eq!(cli.llm.model(), DEFAULT_HF_ROUTER_MODEL);
        assert_eq!(cli.llm.query_settings(), QuerySettings::default());

        let cli = TestCli::parse_args(["test", "--embed-provider", "openai", "--llm-provider", "anthropic"]);
        assert_eq!(cli.embedder.model(), OPENAI_EMBED_MODEL);
        assert_eq!(cli.llm.model(), ANTHROPIC_CHAT_MODEL);
    }

    #[test]
    fn explicit_models_win() {
        let cli = TestCli::parse_args([
            "test",
            "--embed-model",
            "BAAI/bge-small-en-v1.5",
            "--llm-model",
            "HuggingFaceH4/zephyr-7b-beta",
        ]);
        assert_eq!(cli.embedder.model(), "BAAI/bge-small-en-v1.5");
        assert_eq!(cli.llm.model(), "HuggingFaceH4/zephyr-7b-beta");
    }

    #[test]
    fn missing_keys_fail_construction() {
        let cli = TestCli::parse_args(["test", "--embed-provider", "openai", "--llm-provider", "openai"]);
        let credentials = CredentialArgs::default();
        assert!(cli.embedder.build(&credentials).is_err());
        assert!(cli.llm.build(&credentials).is_err());
    }

    #[test]
    fn huggingface_embedder_builds_without_token() {
        let cli = TestCli::parse_args(["test"]);
        let embedder = cli.embedder.build(&CredentialArgs::default()).unwrap();
        assert_eq!(embedder.model_id(), DEFAULT_EMBED_MODEL);
        assert_eq!(embedder.batch_size(), 32);
    }
}
