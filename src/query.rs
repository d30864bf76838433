//! Online question answering over loaded artifacts.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use flat_index::FlatL2Index;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::embedder::Embedder;
use crate::llm::{LlmProvider, ProviderRequest};
use crate::metadata::MetadataTable;
use crate::pipeline::LoadedArtifacts;

/// Passages retrieved when the caller does not choose.
pub const DEFAULT_TOP_K: usize = 5;

const SYSTEM_PROMPT: &str = "Be concise and return a short summary (2-3 sentences).";
const INSTRUCTIONS: &str = "You are a concise assistant. Answer in 2-3 short sentences (very brief). \
Do NOT add extra explanations. Use only the provided context passages.";

/// Prompt and generation limits.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySettings {
    /// Characters kept from each passage in the prompt.
    pub max_passage_chars: usize,
    /// Upper bound on the whole context block, in characters.
    pub max_context_chars: usize,
    /// Completion token cap.
    pub max_completion_tokens: usize,
    /// Sampling temperature; provider default when unset.
    pub temperature: Option<f32>,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_passage_chars: 800,
            max_context_chars: 6000,
            max_completion_tokens: 120,
            temperature: None,
        }
    }
}

/// One retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    /// Row in the index and metadata table.
    pub ordinal: usize,
    /// Source document title.
    pub title: String,
    /// Chunk text, untruncated.
    pub text: String,
    /// Squared L2 distance to the query vector.
    pub distance: f32,
}

/// Result of [`QueryService::answer`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    /// Generated answer, or `[LLM error] ...` when generation failed.
    pub text: String,
    /// Passages the answer was grounded on, closest first.
    pub passages: Vec<RetrievedPassage>,
    /// True when `text` carries a generation error.
    pub generation_failed: bool,
}

/// Read-only context shared by every request.
pub struct QueryService {
    index: FlatL2Index,
    metadata: MetadataTable,
    embedder: Arc<dyn Embedder>,
    provider: Arc<dyn LlmProvider>,
    settings: QuerySettings,
}

impl QueryService {
    /// Wraps loaded artifacts. Fails if index and metadata disagree.
    pub fn new(
        artifacts: LoadedArtifacts,
        embedder: Arc<dyn Embedder>,
        provider: Arc<dyn LlmProvider>,
        settings: QuerySettings,
    ) -> Result<Self> {
        Self::from_parts(
            artifacts.index,
            artifacts.metadata,
            embedder,
            provider,
            settings,
        )
    }

    /// Builds a service from an in-memory index and table.
    pub fn from_parts(
        index: FlatL2Index,
        metadata: MetadataTable,
        embedder: Arc<dyn Embedder>,
        provider: Arc<dyn LlmProvider>,
        settings: QuerySettings,
    ) -> Result<Self> {
        if index.ntotal() != metadata.len() {
            bail!(
                "index holds {} vectors but the metadata table has {} rows",
                index.ntotal(),
                metadata.len()
            );
        }
        Ok(Self {
            index,
            metadata,
            embedder,
            provider,
            settings,
        })
    }

    /// Number of indexed chunks.
    pub fn chunk_count(&self) -> usize {
        self.index.ntotal()
    }

    /// Prompt and generation limits in use.
    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// Embeds a probe string to confirm the embedder is reachable and
    /// produces vectors of the index's dimensionality.
    pub fn probe_embedder(&self) -> Result<()> {
        let vector = self
            .embedder
            .embed_one("dimension probe")
            .context("embedding backend is unreachable")?;
        self.check_dimensions(vector.len())
    }

    /// Returns the `k` closest passages to `query`.
    pub fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedPassage>> {
        let vector = self
            .embedder
            .embed_one(query)
            .context("failed to embed query")?;
        self.retrieve_by_vector(&vector, k)
    }

    /// Returns the `k` closest passages to an already embedded query.
    pub fn retrieve_by_vector(&self, vector: &[f32], k: usize) -> Result<Vec<RetrievedPassage>> {
        self.check_dimensions(vector.len())?;
        let hits = self
            .index
            .search(vector, k)
            .context("index search failed")?;
        hits.into_iter()
            .map(|hit| {
                let record = self.metadata.get(hit.ordinal).with_context(|| {
                    format!("search returned ordinal {} outside the metadata table", hit.ordinal)
                })?;
                Ok(RetrievedPassage {
                    ordinal: hit.ordinal,
                    title: record.title.clone(),
                    text: record.text.clone(),
                    distance: hit.distance,
                })
            })
            .collect()
    }

    /// Retrieves passages and asks the provider for an answer.
    ///
    /// Embedding and search failures are errors. A generation failure is
    /// folded into the answer text and the passages are still returned.
    pub fn answer(&self, question: &str, k: usize) -> Result<Answer> {
        let started = Instant::now();
        let passages = self.retrieve(question, k)?;
        let prompt = build_prompt(question, &passages, &self.settings);
        debug!(chars = prompt.chars().count(), "prompt assembled");
        let request = ProviderRequest {
            system: SYSTEM_PROMPT,
            prompt: &prompt,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_completion_tokens,
        };
        let (text, generation_failed) = match self.provider.answer(&request) {
            Ok(text) => (text.trim().to_string(), false),
            Err(err) => {
                warn!(provider = self.provider.name(), error = %format!("{err:#}"), "generation failed");
                (format!("[LLM error] {err:#}"), true)
            }
        };
        info!(
            passages = passages.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            generation_failed,
            "query answered"
        );
        Ok(Answer {
            text,
            passages,
            generation_failed,
        })
    }

    fn check_dimensions(&self, got: usize) -> Result<()> {
        if got != self.index.dim() {
            bail!(
                "query embedding has {} dimensions but the index was built with {}; \
                 was it built with a different embedding model?",
                got,
                self.index.dim()
            );
        }
        Ok(())
    }
}

/// Formats the user prompt: instructions, capped passages, then the question.
///
/// Each passage is cut to `max_passage_chars` and passages stop being added
/// once the context would exceed `max_context_chars`; the first passage is
/// always included.
pub fn build_prompt(question: &str, passages: &[RetrievedPassage], settings: &QuerySettings) -> String {
    let mut context = String::new();
    let mut context_chars = 0usize;
    for passage in passages {
        let entry = format!("- {}", truncate_chars(&passage.text, settings.max_passage_chars));
        let entry_chars = entry.chars().count();
        let separator = if context.is_empty() { 0 } else { 2 };
        if !context.is_empty() && context_chars + separator + entry_chars > settings.max_context_chars {
            break;
        }
        if separator > 0 {
            context.push_str("\n\n");
        }
        context.push_str(&entry);
        context_chars += separator + entry_chars;
    }
    format!("{INSTRUCTIONS}\n\nContext:\n{context}\n\nQuestion: {question}\nAnswer:")
}

/// Cuts `text` to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}
