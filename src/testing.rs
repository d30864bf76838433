//! Offline stand-ins for the remote backends.

use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::embedder::Embedder;
use crate::llm::{LlmProvider, ProviderRequest};
use crate::metadata::ChunkRecord;
use crate::pipeline::build_artifacts;
use crate::query::{QueryService, QuerySettings};

/// Two-axis embedder: dog words on one axis, car words on the other.
pub(crate) struct KeywordEmbedder;

impl Embedder for KeywordEmbedder {
    fn model_id(&self) -> &str {
        "keyword"
    }

    fn batch_size(&self) -> usize {
        8
    }

    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs
            .iter()
            .map(|input| {
                let lower = input.to_lowercase();
                let dog = ["dog", "bark", "mammal"]
                    .iter()
                    .filter(|w| lower.contains(*w))
                    .count();
                let car = ["car", "engine", "wheel"]
                    .iter()
                    .filter(|w| lower.contains(*w))
                    .count();
                vec![dog as f32, car as f32]
            })
            .collect())
    }
}

/// Returns a fixed reply and records every prompt it was sent.
pub(crate) struct CannedProvider {
    reply: String,
    pub(crate) prompts: Mutex<Vec<String>>,
}

impl CannedProvider {
    pub(crate) fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

impl LlmProvider for CannedProvider {
    fn name(&self) -> &str {
        "canned"
    }

    fn answer(&self, request: &ProviderRequest) -> Result<String> {
        self.prompts
            .lock()
            .expect("prompt log poisoned")
            .push(request.prompt.to_string());
        Ok(self.reply.clone())
    }
}

/// Always fails like an unavailable endpoint.
pub(crate) struct FailingProvider;

impl LlmProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    fn answer(&self, _request: &ProviderRequest) -> Result<String> {
        anyhow::bail!("503 Service Unavailable")
    }
}

/// Service over a dog chunk (ordinal 0) and a car chunk (ordinal 1).
pub(crate) fn dog_car_service(provider: Arc<dyn LlmProvider>) -> QueryService {
    let chunks = vec![
        ChunkRecord {
            title: "Dog".into(),
            text: "Dogs are loyal mammals. They bark.".into(),
        },
        ChunkRecord {
            title: "Car".into(),
            text: "A car has an engine and four wheels.".into(),
        },
    ];
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    let vectors = KeywordEmbedder
        .embed_batch(&texts)
        .expect("keyword embedding is infallible");
    let built = build_artifacts(chunks, vectors).expect("aligned artifacts");
    QueryService::from_parts(
        built.index,
        built.metadata,
        Arc::new(KeywordEmbedder),
        provider,
        QuerySettings::default(),
    )
    .expect("aligned service")
}
