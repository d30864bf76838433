//! Offline index build: chunk, embed, index and persist.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flat_index::FlatL2Index;
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};
use tracing::{info, warn};

use crate::chunker::chunk_document;
use crate::corpus::Document;
use crate::manifest::IndexManifest;
use crate::metadata::{ChunkRecord, MetadataTable};

mod embed;

pub use embed::embed_chunks;

/// File names of one artifact set, all inside a single directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Parquet metadata table.
    pub metadata: PathBuf,
    /// FAISS-layout flat L2 index.
    pub index: PathBuf,
    /// Optional `.npy` dump of the raw vectors.
    pub embeddings: PathBuf,
    /// Build manifest.
    pub manifest: PathBuf,
}

impl ArtifactPaths {
    /// Standard artifact names under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            metadata: dir.join("metadata.parquet"),
            index: dir.join("wiki_index.faiss"),
            embeddings: dir.join("embeddings.npy"),
            manifest: dir.join("manifest.json"),
        }
    }
}

/// Chunks every document in corpus order.
pub fn chunk_corpus(documents: &[Document], max_len: usize) -> Vec<ChunkRecord> {
    documents
        .iter()
        .flat_map(|document| chunk_document(document, max_len))
        .collect()
}

/// Index plus metadata with `index.ntotal() == metadata.len()`.
#[derive(Debug)]
pub struct BuiltArtifacts {
    /// Flat L2 index; ordinal `i` is metadata row `i`.
    pub index: FlatL2Index,
    /// Chunk metadata.
    pub metadata: MetadataTable,
}

/// Builds the index from aligned chunks and vectors.
///
/// Fails when the counts differ, when there is nothing to index or when the
/// vectors do not share one dimensionality.
pub fn build_artifacts(chunks: Vec<ChunkRecord>, vectors: Vec<Vec<f32>>) -> Result<BuiltArtifacts> {
    if chunks.len() != vectors.len() {
        bail!(
            "refusing to build a misaligned index: {} chunks but {} embeddings",
            chunks.len(),
            vectors.len()
        );
    }
    let Some(first) = vectors.first() else {
        bail!("no embeddings to index");
    };
    let dim = first.len();
    if let Some((ordinal, ragged)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dim) {
        bail!(
            "embedding {} has {} dimensions, expected {}",
            ordinal,
            ragged.len(),
            dim
        );
    }

    let mut index = FlatL2Index::new(dim).context("failed to create flat index")?;
    index
        .add_rows(&vectors)
        .context("failed to add embeddings to the index")?;
    let metadata = MetadataTable::new(chunks);
    debug_assert_eq!(index.ntotal(), metadata.len());
    info!(vectors = index.ntotal(), dimensions = dim, "index built");
    Ok(BuiltArtifacts { index, metadata })
}

impl BuiltArtifacts {
    /// Writes metadata, index and manifest.
    pub fn persist(&self, paths: &ArtifactPaths, manifest: &IndexManifest) -> Result<()> {
        manifest.check_artifacts(self.index.dim(), self.index.ntotal())?;
        for path in [&paths.metadata, &paths.index, &paths.manifest] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {:?}", parent))?;
            }
        }
        self.metadata.write_parquet(&paths.metadata)?;
        self.index
            .save(&paths.index)
            .with_context(|| format!("failed to write index {:?}", paths.index))?;
        manifest.save(&paths.manifest)?;
        info!(
            metadata = %paths.metadata.display(),
            index = %paths.index.display(),
            manifest = %paths.manifest.display(),
            "artifacts written"
        );
        Ok(())
    }
}

/// Writes vectors as a `(rows, dim)` little-endian `f32` `.npy` array.
pub fn write_embeddings(path: &Path, vectors: &[Vec<f32>]) -> Result<()> {
    let dim = vectors.first().map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(vectors.len() * dim);
    for vector in vectors {
        if vector.len() != dim {
            bail!("cannot save ragged embeddings ({} vs {})", vector.len(), dim);
        }
        flat.extend_from_slice(vector);
    }
    let array = Array2::from_shape_vec((vectors.len(), dim), flat)
        .context("failed to shape embeddings array")?;
    write_npy(path, &array).with_context(|| format!("failed to write embeddings {:?}", path))
}

/// Reads a `.npy` array written by [`write_embeddings`] (or numpy).
pub fn read_embeddings(path: &Path) -> Result<Vec<Vec<f32>>> {
    let array: Array2<f32> =
        read_npy(path).with_context(|| format!("failed to read embeddings {:?}", path))?;
    Ok(array.outer_iter().map(|row| row.to_vec()).collect())
}

/// Vectors from an earlier `embeddings.npy` and the model that produced them.
#[derive(Debug)]
pub struct ReusedEmbeddings {
    /// One vector per chunk, in chunk order.
    pub vectors: Vec<Vec<f32>>,
    /// Embedding model recorded for the vectors.
    pub model: String,
}

/// Loads saved embeddings for a rebuild and proves they still fit the chunks.
///
/// The previous manifest, when present, must agree on chunk count, chunking
/// bound and dimensionality; its model id is carried over. Only a missing
/// manifest falls back to `configured_model`.
pub fn reuse_embeddings(
    paths: &ArtifactPaths,
    chunk_count: usize,
    max_chunk_len: usize,
    configured_model: &str,
) -> Result<ReusedEmbeddings> {
    let vectors = read_embeddings(&paths.embeddings)?;
    if vectors.len() != chunk_count {
        bail!(
            "{:?} holds {} embeddings but the corpus produced {} chunks",
            paths.embeddings,
            vectors.len(),
            chunk_count
        );
    }
    let dim = vectors.first().map_or(0, Vec::len);

    let model = if paths.manifest.exists() {
        let previous = IndexManifest::load(&paths.manifest)
            .context("cannot reuse embeddings without a readable manifest")?;
        if previous.max_chunk_len != max_chunk_len {
            bail!(
                "saved embeddings were chunked with max_chunk_len {}, not {}",
                previous.max_chunk_len,
                max_chunk_len
            );
        }
        previous
            .check_artifacts(dim, chunk_count)
            .context("saved embeddings do not match the previous manifest")?;
        previous.embedding_model
    } else {
        warn!(
            path = %paths.manifest.display(),
            model = configured_model,
            "no previous manifest; recording the configured embedding model"
        );
        configured_model.to_string()
    };
    info!(
        path = %paths.embeddings.display(),
        embeddings = vectors.len(),
        "reusing saved embeddings"
    );
    Ok(ReusedEmbeddings { vectors, model })
}

/// Artifacts loaded for serving.
#[derive(Debug)]
pub struct LoadedArtifacts {
    /// Flat index.
    pub index: FlatL2Index,
    /// Metadata table aligned with the index.
    pub metadata: MetadataTable,
    /// Build manifest; absent for artifacts produced without one.
    pub manifest: Option<IndexManifest>,
}

impl LoadedArtifacts {
    /// Loads and cross-checks an artifact set.
    pub fn load(paths: &ArtifactPaths) -> Result<Self> {
        let index = FlatL2Index::load(&paths.index)
            .with_context(|| format!("failed to load index {:?}", paths.index))?;
        let metadata = MetadataTable::read_parquet(&paths.metadata)?;
        if index.ntotal() != metadata.len() {
            bail!(
                "index holds {} vectors but the metadata table has {} rows",
                index.ntotal(),
                metadata.len()
            );
        }
        let manifest = if paths.manifest.exists() {
            let manifest = IndexManifest::load(&paths.manifest)?;
            manifest.check_artifacts(index.dim(), index.ntotal())?;
            Some(manifest)
        } else {
            warn!(
                path = %paths.manifest.display(),
                "no manifest found; the embedding model cannot be verified"
            );
            None
        };
        info!(
            vectors = index.ntotal(),
            dimensions = index.dim(),
            "artifacts loaded"
        );
        Ok(Self {
            index,
            metadata,
            manifest,
        })
    }

    /// Checks the recorded embedding model against `model_id`.
    pub fn check_model(&self, model_id: &str, allow_mismatch: bool) -> Result<()> {
        match &self.manifest {
            Some(manifest) => manifest.check_model(model_id, allow_mismatch),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(title: &str, text: &str) -> ChunkRecord {
        ChunkRecord {
            title: title.into(),
            text: text.into(),
        }
    }

    #[test]
    fn count_mismatch_is_fatal() {
        let err = build_artifacts(vec![record("A", "a"), record("B", "b")], vec![vec![0.0; 3]])
            .unwrap_err();
        assert!(err.to_string().contains("misaligned"), "{err}");
    }

    #[test]
    fn empty_and_ragged_inputs_are_fatal() {
        assert!(build_artifacts(Vec::new(), Vec::new()).is_err());
        let err = build_artifacts(
            vec![record("A", "a"), record("B", "b")],
            vec![vec![0.0; 3], vec![0.0; 2]],
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding 1"), "{err}");
    }

    #[test]
    fn every_chunk_retrieves_itself() {
        let chunks: Vec<_> = (0..6).map(|i| record("T", &format!("chunk {i}"))).collect();
        let vectors: Vec<Vec<f32>> = (0..6).map(|i| vec![i as f32, (i * i) as f32]).collect();
        let built = build_artifacts(chunks, vectors.clone()).unwrap();
        assert_eq!(built.index.ntotal(), built.metadata.len());
        for (i, vector) in vectors.iter().enumerate() {
            let hits = built.index.search(vector, 1).unwrap();
            assert_eq!(hits[0].ordinal, i);
            assert_eq!(hits[0].distance, 0.0);
            assert_eq!(built.metadata.get(i).unwrap().text, format!("chunk {i}"));
        }
    }

    #[test]
    fn chunk_corpus_keeps_document_order() {
        let documents = vec![
            Document {
                title: "Dog".into(),
                text: "Dogs are mammals. Dogs bark.".into(),
            },
            Document {
                title: "Car".into(),
                text: "Cars have engines.".into(),
            },
        ];
        let chunks = chunk_corpus(&documents, 18);
        let titles: Vec<_> = chunks.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["Dog", "Dog", "Car"]);
    }

    #[test]
    fn persisted_artifacts_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::in_dir(dir.path().join("out"));
        let built = build_artifacts(
            vec![record("A", "alpha"), record("B", "beta")],
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
        )
        .unwrap();
        let manifest = IndexManifest::new("stub-model", 2, 2, 800);
        built.persist(&paths, &manifest).unwrap();

        let loaded = LoadedArtifacts::load(&paths).unwrap();
        assert_eq!(loaded.index.ntotal(), 2);
        assert_eq!(loaded.metadata, built.metadata);
        assert_eq!(loaded.manifest.as_ref(), Some(&manifest));
        assert!(loaded.check_model("stub-model", false).is_ok());
        assert!(loaded.check_model("other-model", false).is_err());
    }

    #[test]
    fn load_rejects_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::in_dir(dir.path());
        let built = build_artifacts(
            vec![record("A", "alpha"), record("B", "beta")],
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
        )
        .unwrap();
        built
            .persist(&paths, &IndexManifest::new("stub-model", 2, 2, 800))
            .unwrap();
        MetadataTable::new(vec![record("A", "alpha")])
            .write_parquet(&paths.metadata)
            .unwrap();

        let err = LoadedArtifacts::load(&paths).unwrap_err();
        assert!(err.to_string().contains("metadata table has 1 rows"), "{err}");
    }

    #[test]
    fn missing_manifest_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::in_dir(dir.path());
        let built = build_artifacts(vec![record("A", "alpha")], vec![vec![1.0, 2.0, 3.0]]).unwrap();
        built
            .persist(&paths, &IndexManifest::new("stub-model", 3, 1, 800))
            .unwrap();
        std::fs::remove_file(&paths.manifest).unwrap();

        let loaded = LoadedArtifacts::load(&paths).unwrap();
        assert!(loaded.manifest.is_none());
        assert!(loaded.check_model("anything", false).is_ok());
    }

    #[test]
    fn embeddings_npy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.npy");
        let vectors = vec![vec![0.25f32, -1.5, 3.0], vec![4.0, 5.5, -6.125]];
        write_embeddings(&path, &vectors).unwrap();
        assert_eq!(read_embeddings(&path).unwrap(), vectors);
    }

    fn saved_build(dir: &Path, max_chunk_len: usize) -> ArtifactPaths {
        let paths = ArtifactPaths::in_dir(dir);
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        write_embeddings(&paths.embeddings, &vectors).unwrap();
        IndexManifest::new("saved-model", 2, 2, max_chunk_len)
            .save(&paths.manifest)
            .unwrap();
        paths
    }

    #[test]
    fn reuse_carries_the_recorded_model() {
        let dir = tempfile::tempdir().unwrap();
        let paths = saved_build(dir.path(), 800);
        let reused = reuse_embeddings(&paths, 2, 800, "configured-model").unwrap();
        assert_eq!(reused.model, "saved-model");
        assert_eq!(reused.vectors.len(), 2);
    }

    #[test]
    fn reuse_without_manifest_records_configured_model() {
        let dir = tempfile::tempdir().unwrap();
        let paths = saved_build(dir.path(), 800);
        std::fs::remove_file(&paths.manifest).unwrap();
        let reused = reuse_embeddings(&paths, 2, 800, "configured-model").unwrap();
        assert_eq!(reused.model, "configured-model");
    }

    #[test]
    fn reuse_refuses_unreadable_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let paths = saved_build(dir.path(), 800);
        std::fs::write(&paths.manifest, "{ not json").unwrap();
        let err = reuse_embeddings(&paths, 2, 800, "configured-model").unwrap_err();
        assert!(format!("{err:#}").contains("readable manifest"), "{err:#}");
    }

    #[test]
    fn reuse_refuses_changed_chunking() {
        let dir = tempfile::tempdir().unwrap();
        let paths = saved_build(dir.path(), 800);
        let err = reuse_embeddings(&paths, 2, 400, "configured-model").unwrap_err();
        assert!(err.to_string().contains("max_chunk_len 800"), "{err}");
    }

    #[test]
    fn reuse_refuses_stale_chunk_count() {
        let dir = tempfile::tempdir().unwrap();
        let paths = saved_build(dir.path(), 800);
        IndexManifest::new("saved-model", 2, 3, 800)
            .save(&paths.manifest)
            .unwrap();
        assert!(reuse_embeddings(&paths, 2, 800, "configured-model").is_err());
        assert!(reuse_embeddings(&paths, 3, 800, "configured-model").is_err());
    }
}
