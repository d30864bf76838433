use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use wikirag::corpus::{CorpusSource, HfDatasetQuery};
use wikirag::pipeline::{self, ArtifactPaths};
use wikirag::settings::{CredentialArgs, EmbedderArgs};
use wikirag::{IndexManifest, DEFAULT_MAX_CHUNK_LEN};

#[derive(Parser, Debug)]
#[command(
    name = "wikirag-index",
    about = "Chunk a Wikipedia subset, embed it and write a flat L2 index"
)]
struct IndexCli {
    /// JSONL or Parquet corpus with title/text fields (fetched from the datasets-server when omitted)
    #[arg(long, env = "WIKIRAG_INPUT")]
    input: Option<PathBuf>,

    /// Hugging Face dataset id
    #[arg(long, env = "WIKIRAG_HF_DATASET", default_value = "wikimedia/wikipedia")]
    hf_dataset: String,

    /// Dataset config
    #[arg(long, env = "WIKIRAG_HF_CONFIG", default_value = "20231101.en")]
    hf_config: String,

    /// Dataset split
    #[arg(long, env = "WIKIRAG_HF_SPLIT", default_value = "train")]
    hf_split: String,

    /// First dataset row to fetch
    #[arg(long, default_value_t = 0)]
    hf_offset: usize,

    /// datasets-server base URL
    #[arg(
        long,
        env = "WIKIRAG_DATASETS_SERVER",
        default_value = "https://datasets-server.huggingface.co"
    )]
    datasets_server: String,

    /// Maximum documents to read (1000 for the datasets-server when unset)
    #[arg(long, env = "WIKIRAG_LIMIT")]
    limit: Option<usize>,

    /// Upper bound on chunk length, in characters
    #[arg(long, env = "WIKIRAG_MAX_CHUNK_LEN", default_value_t = DEFAULT_MAX_CHUNK_LEN)]
    max_chunk_len: usize,

    /// Directory the artifacts are written to
    #[arg(long, env = "WIKIRAG_OUT_DIR", default_value = "data")]
    out_dir: PathBuf,

    /// Worker threads issuing embedding requests
    #[arg(long, env = "WIKIRAG_EMBED_THREADS", default_value_t = 1)]
    embed_threads: usize,

    /// Rebuild the index from an existing embeddings.npy instead of embedding again
    #[arg(long, default_value_t = false)]
    reuse_embeddings: bool,

    /// Do not write embeddings.npy
    #[arg(long, default_value_t = false)]
    skip_embeddings_file: bool,

    #[command(flatten)]
    credentials: CredentialArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

fn main() -> Result<()> {
    wikirag::init_tracing();
    let cli = IndexCli::parse();
    if cli.max_chunk_len == 0 {
        bail!("--max-chunk-len must be positive");
    }
    let paths = ArtifactPaths::in_dir(&cli.out_dir);
    fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("failed to create {:?}", cli.out_dir))?;

    let source = match &cli.input {
        Some(path) => CorpusSource::from_path(path),
        None => CorpusSource::HuggingFace(HfDatasetQuery {
            dataset: cli.hf_dataset.clone(),
            config: cli.hf_config.clone(),
            split: cli.hf_split.clone(),
            offset: cli.hf_offset,
            endpoint: cli.datasets_server.clone(),
            token: cli.credentials.hf_token.clone(),
            timeout: Duration::from_secs(cli.embedder.embed_timeout_secs.max(1)),
        }),
    };
    let documents = source.load(cli.limit)?;
    if documents.is_empty() {
        bail!("corpus is empty; nothing to index");
    }

    let chunks = pipeline::chunk_corpus(&documents, cli.max_chunk_len);
    info!(
        documents = documents.len(),
        chunks = chunks.len(),
        max_chunk_len = cli.max_chunk_len,
        "corpus chunked"
    );
    drop(documents);

    let (vectors, model) = if cli.reuse_embeddings {
        let reused = pipeline::reuse_embeddings(
            &paths,
            chunks.len(),
            cli.max_chunk_len,
            cli.embedder.model(),
        )?;
        (reused.vectors, reused.model)
    } else {
        let embedder = cli.embedder.build(&cli.credentials)?;
        let vectors = pipeline::embed_chunks(embedder.as_ref(), &chunks, cli.embed_threads)?;
        if !cli.skip_embeddings_file {
            pipeline::write_embeddings(&paths.embeddings, &vectors)?;
            info!(path = %paths.embeddings.display(), "embeddings saved");
        }
        (vectors, embedder.model_id().to_string())
    };

    let built = pipeline::build_artifacts(chunks, vectors)?;
    let manifest = IndexManifest::new(
        model,
        built.index.dim(),
        built.index.ntotal(),
        cli.max_chunk_len,
    );
    built.persist(&paths, &manifest)?;
    info!(
        chunks = manifest.chunk_count,
        dimensions = manifest.dimensions,
        model = %manifest.embedding_model,
        "index build complete"
    );
    Ok(())
}
