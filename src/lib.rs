#![warn(missing_docs)]
//! Core library for the wikirag question-answering pipeline.
//!
//! Offline, [`pipeline`] turns a corpus into a flat L2 index plus a metadata
//! table. Online, [`query::QueryService`] answers questions against those
//! artifacts and [`web`] serves it behind an HTML form.

pub mod chunker;
pub mod corpus;
pub mod embedder;
pub mod llm;
pub mod manifest;
pub mod metadata;
pub mod pipeline;
pub mod query;
pub mod settings;
#[cfg(test)]
mod testing;
pub mod web;

pub use chunker::{chunk_document, chunk_text, DEFAULT_MAX_CHUNK_LEN};
pub use corpus::{CorpusSource, Document};
pub use embedder::Embedder;
pub use llm::{LlmProvider, ProviderRequest};
pub use manifest::IndexManifest;
pub use metadata::{ChunkRecord, MetadataTable};
pub use pipeline::{ArtifactPaths, BuiltArtifacts, LoadedArtifacts};
pub use query::{Answer, QueryService, RetrievedPassage};

use tracing_subscriber::EnvFilter;

/// Installs the stderr `tracing` subscriber used by every binary.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
