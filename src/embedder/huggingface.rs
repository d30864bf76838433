//! Hugging Face Inference `feature-extraction` client.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{is_retryable_error, retry_backoff, should_retry, Embedder};

/// Default base for the serverless inference provider behind the HF router.
pub const DEFAULT_HF_INFERENCE_BASE: &str = "https://router.huggingface.co/hf-inference";

/// Blocking client for `{base}/models/{model}/pipeline/feature-extraction`.
///
/// Sentence-transformers models answer with one pooled vector per input.
/// Plain encoder models answer with per-token vectors, which are mean-pooled
/// here so both shapes yield one vector per input.
#[derive(Clone)]
pub struct HuggingFaceEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    max_retries: usize,
    batch_size: usize,
}

impl HuggingFaceEmbedder {
    /// Builds a new client. The token is optional for public models but
    /// anonymous calls are heavily rate limited.
    ///
    /// # Arguments
    /// * `token` - Value for the bearer header (usually from `HF_TOKEN`)
    /// * `base_url` - Inference base, e.g. [`DEFAULT_HF_INFERENCE_BASE`]
    /// * `model` - Hub model id, e.g. `sentence-transformers/all-MiniLM-L6-v2`
    pub fn new(
        token: Option<&str>,
        base_url: &str,
        model: String,
        timeout: Duration,
        max_retries: usize,
        batch_size: usize,
    ) -> Result<Self> {
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "Hugging Face inference base must be an http(s) URL"
        );
        anyhow::ensure!(!model.trim().is_empty(), "missing Hugging Face model id");
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            let auth = format!("Bearer {token}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).context("invalid Hugging Face token")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Hugging Face HTTP client")?;
        let endpoint = format!(
            "{}/models/{}/pipeline/feature-extraction",
            base_url.trim_end_matches('/'),
            model.trim()
        );
        Ok(Self {
            client,
            endpoint,
            model,
            max_retries: max_retries.max(1),
            batch_size: batch_size.max(1),
        })
    }
}

impl Embedder for HuggingFaceEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        anyhow::ensure!(
            inputs.len() <= self.batch_size,
            "batch of {} exceeds configured max {}",
            inputs.len(),
            self.batch_size
        );

        let request = FeatureRequest { inputs };
        let mut attempt = 0usize;
        loop {
            match self.client.post(&self.endpoint).json(&request).send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let payload: FeatureResponse = resp
                            .json()
                            .context("failed to parse feature-extraction response")?;
                        return payload.into_embeddings(inputs.len());
                    }
                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    // 503 while the model is loading is covered by should_retry.
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(%status, attempt, model = %self.model, "retrying feature-extraction request");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    anyhow::bail!(
                        "Hugging Face feature-extraction failed ({}): {}",
                        status,
                        body
                    );
                }
                Err(err) => {
                    if is_retryable_error(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(error = %err, attempt, "retrying feature-extraction request");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(err).context("failed to call Hugging Face inference");
                }
            }
        }
    }
}

#[derive(Serialize)]
struct FeatureRequest<'a> {
    inputs: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeatureResponse {
    Pooled(Vec<Vec<f32>>),
    TokenLevel(Vec<Vec<Vec<f32>>>),
}

impl FeatureResponse {
    fn into_embeddings(self, expected_len: usize) -> Result<Vec<Vec<f32>>> {
        let embeddings = match self {
            Self::Pooled(vectors) => vectors,
            Self::TokenLevel(per_input) => per_input
                .into_iter()
                .map(mean_pool)
                .collect::<Result<Vec<_>>>()?,
        };
        anyhow::ensure!(
            embeddings.len() == expected_len,
            "Hugging Face returned {} embeddings for {} inputs",
            embeddings.len(),
            expected_len
        );
        Ok(embeddings)
    }
}

fn mean_pool(tokens: Vec<Vec<f32>>) -> Result<Vec<f32>> {
    let dim = tokens
        .first()
        .map(Vec::len)
        .ok_or_else(|| anyhow!("feature-extraction returned no token vectors"))?;
    let mut pooled = vec![0.0f32; dim];
    for token in &tokens {
        anyhow::ensure!(token.len() == dim, "token vectors have mixed widths");
        for (acc, value) in pooled.iter_mut().zip(token) {
            *acc += value;
        }
    }
    let count = tokens.len() as f32;
    pooled.iter_mut().for_each(|value| *value /= count);
    Ok(pooled)
}
