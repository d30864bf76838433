//! OpenAI-compatible `/embeddings` client.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{is_retryable_error, retry_backoff, should_retry, Embedder};

/// Blocking embeddings client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    max_retries: usize,
    batch_size: usize,
}

impl OpenAiEmbedder {
    /// Builds a client posting to `{base_url}/embeddings`.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: String,
        dimensions: Option<usize>,
        timeout: Duration,
        max_retries: usize,
        batch_size: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing OpenAI model name");
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model,
            dimensions,
            max_retries: max_retries.max(1),
            batch_size: batch_size.max(1),
        })
    }
}

impl Embedder for OpenAiEmbedder {
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

        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        };
        let mut attempt = 0usize;
        loop {
            match self.client.post(&self.endpoint).json(&request).send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: EmbeddingResponse = resp
                            .json()
                            .context("failed to parse OpenAI embedding response")?;
                        return parsed.into_vectors(inputs.len());
                    }
                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(%status, attempt, "retrying OpenAI embeddings request");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    anyhow::bail!("OpenAI embeddings request failed ({}): {}", status, body);
                }
                Err(err) => {
                    if is_retryable_error(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(error = %err, attempt, "retrying OpenAI embeddings request");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(err).context("failed to call OpenAI embeddings endpoint");
                }
            }
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    #[serde(borrow)]
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl EmbeddingResponse {
    // Entries may arrive out of order; `index` is authoritative.
    fn into_vectors(mut self, expected: usize) -> Result<Vec<Vec<f32>>> {
        self.data.sort_by_key(|entry| entry.index);
        anyhow::ensure!(
            self.data.len() == expected,
            "OpenAI returned {} embeddings for {} inputs",
            self.data.len(),
            expected
        );
        Ok(self.data.into_iter().map(|entry| entry.embedding).collect())
    }
}
