//! Text embedding backends.
//!
//! Every backend is a blocking HTTP client. The index build calls them from a
//! worker pool and the web service from `spawn_blocking`, so implementations
//! must be `Send + Sync`.

use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;

mod huggingface;
mod openai;

pub use huggingface::{HuggingFaceEmbedder, DEFAULT_HF_INFERENCE_BASE};
pub use openai::OpenAiEmbedder;

/// Model used when none is configured; 384-dimensional output.
pub const DEFAULT_EMBED_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Maps text to fixed-length vectors.
pub trait Embedder: Send + Sync {
    /// Identifier of the model producing the vectors, recorded in the manifest.
    fn model_id(&self) -> &str;

    /// Largest batch accepted by [`Embedder::embed_batch`].
    fn batch_size(&self) -> usize;

    /// Embeds `inputs`, returning one vector per input in the same order.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embeds a single string.
    fn embed_one(&self, input: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[input])?;
        anyhow::ensure!(
            vectors.len() == 1,
            "embedder returned {} vectors for one input",
            vectors.len()
        );
        Ok(vectors.swap_remove(0))
    }
}

pub(crate) fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub(crate) fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() || err.is_decode()
}

pub(crate) fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}
