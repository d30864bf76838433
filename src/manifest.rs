//! Sidecar describing how a set of index artifacts was produced.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Current manifest schema version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Build parameters recorded next to the index and metadata table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Schema version of this file.
    pub format_version: u32,
    /// Model id reported by the embedder used at build time.
    pub embedding_model: String,
    /// Vector dimensionality.
    pub dimensions: usize,
    /// Number of chunks (index vectors and metadata rows).
    pub chunk_count: usize,
    /// Chunker limit in characters.
    pub max_chunk_len: usize,
    /// Epoch milliseconds when the build finished.
    pub created_epoch_ms: u64,
}

impl IndexManifest {
    /// Creates a manifest stamped with the current time.
    pub fn new(
        embedding_model: impl Into<String>,
        dimensions: usize,
        chunk_count: usize,
        max_chunk_len: usize,
    ) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            embedding_model: embedding_model.into(),
            dimensions,
            chunk_count,
            max_chunk_len,
            created_epoch_ms: now_epoch_ms(),
        }
    }

    /// Writes the manifest as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to encode manifest")?;
        fs::write(path, json).with_context(|| format!("failed to write manifest {:?}", path))
    }

    /// Reads a manifest, rejecting unknown schema versions.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            fs::read(path).with_context(|| format!("failed to read manifest {:?}", path))?;
        let manifest: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid manifest {:?}", path))?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            bail!(
                "manifest {:?} has format version {}, expected {}",
                path,
                manifest.format_version,
                MANIFEST_FORMAT_VERSION
            );
        }
        Ok(manifest)
    }

    /// Checks the manifest against the artifacts it describes.
    pub fn check_artifacts(&self, dimensions: usize, chunk_count: usize) -> Result<()> {
        if self.dimensions != dimensions {
            bail!(
                "manifest records {} dimensions but the index has {}",
                self.dimensions,
                dimensions
            );
        }
        if self.chunk_count != chunk_count {
            bail!(
                "manifest records {} chunks but the artifacts hold {}",
                self.chunk_count,
                chunk_count
            );
        }
        Ok(())
    }

    /// Checks that queries will be embedded by the model used at build time.
    ///
    /// A differing model id is only tolerated with `allow_mismatch`.
    pub fn check_model(&self, model_id: &str, allow_mismatch: bool) -> Result<()> {
        if self.embedding_model == model_id {
            return Ok(());
        }
        if allow_mismatch {
            warn!(
                built_with = %self.embedding_model,
                querying_with = %model_id,
                "embedding model differs from the one used to build the index"
            );
            return Ok(());
        }
        bail!(
            "index was built with embedding model '{}' but the configured model is '{}' \
             (pass --allow-model-mismatch to override)",
            self.embedding_model,
            model_id
        )
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = IndexManifest::new(MODEL, 384, 12, 800);
        manifest.save(&path).unwrap();
        assert_eq!(IndexManifest::load(&path).unwrap(), manifest);
    }

    #[test]
    fn unknown_format_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut manifest = IndexManifest::new(MODEL, 384, 12, 800);
        manifest.format_version = 99;
        manifest.save(&path).unwrap();
        let err = IndexManifest::load(&path).unwrap_err();
        assert!(err.to_string().contains("format version 99"), "{err}");
    }

    #[test]
    fn dimension_and_count_mismatches_are_rejected() {
        let manifest = IndexManifest::new(MODEL, 384, 12, 800);
        assert!(manifest.check_artifacts(384, 12).is_ok());
        assert!(manifest.check_artifacts(768, 12).is_err());
        assert!(manifest.check_artifacts(384, 11).is_err());
    }

    #[test]
    fn model_mismatch_needs_explicit_override() {
        let manifest = IndexManifest::new(MODEL, 384, 12, 800);
        assert!(manifest.check_model(MODEL, false).is_ok());
        let err = manifest
            .check_model("text-embedding-3-small", false)
            .unwrap_err();
        assert!(err.to_string().contains("--allow-model-mismatch"), "{err}");
        assert!(manifest.check_model("text-embedding-3-small", true).is_ok());
    }
}
