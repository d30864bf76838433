//! Corpus sources feeding the offline pipeline.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metadata;

/// Rows pulled from the datasets-server when no explicit limit is given.
pub const DEFAULT_HF_ROWS: usize = 1000;

/// The datasets-server refuses pages longer than this.
const HF_PAGE_LIMIT: usize = 100;

/// One source article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Article title; not guaranteed unique.
    pub title: String,
    /// Full article body.
    pub text: String,
}

/// Coordinates of a Hugging Face dataset split served by the datasets-server.
#[derive(Debug, Clone)]
pub struct HfDatasetQuery {
    /// Dataset id, e.g. `wikimedia/wikipedia`.
    pub dataset: String,
    /// Dataset config, e.g. `20231101.en`.
    pub config: String,
    /// Split name.
    pub split: String,
    /// First row to fetch.
    pub offset: usize,
    /// Base URL of the datasets-server.
    pub endpoint: String,
    /// Optional bearer token for gated datasets.
    pub token: Option<String>,
    /// HTTP timeout per page.
    pub timeout: Duration,
}

/// Where documents are read from.
#[derive(Debug, Clone)]
pub enum CorpusSource {
    /// One JSON object with `title` and `text` per line.
    Jsonl(PathBuf),
    /// Parquet file with `title` and `text` string columns.
    Parquet(PathBuf),
    /// Rows fetched page by page from the datasets-server.
    HuggingFace(HfDatasetQuery),
}

impl CorpusSource {
    /// Picks the file reader from the extension: `.parquet` or JSONL otherwise.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let is_parquet = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"));
        if is_parquet {
            Self::Parquet(path)
        } else {
            Self::Jsonl(path)
        }
    }

    /// Reads up to `limit` documents.
    pub fn load(&self, limit: Option<usize>) -> Result<Vec<Document>> {
        let documents = match self {
            Self::Jsonl(path) => load_jsonl(path, limit)?,
            Self::Parquet(path) => load_parquet(path, limit)?,
            Self::HuggingFace(query) => fetch_hf_rows(query, limit.unwrap_or(DEFAULT_HF_ROWS))?,
        };
        info!(documents = documents.len(), "corpus loaded");
        Ok(documents)
    }
}

fn load_jsonl(path: &Path, limit: Option<usize>) -> Result<Vec<Document>> {
    let file = File::open(path).with_context(|| format!("failed to open corpus {:?}", path))?;
    read_jsonl(BufReader::new(file), limit)
}

/// Parses JSONL documents; blank lines are skipped and extra fields ignored.
pub fn read_jsonl<R: BufRead>(reader: R, limit: Option<usize>) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        if limit.is_some_and(|max| documents.len() >= max) {
            break;
        }
        let line = line.with_context(|| format!("failed to read corpus line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let document: Document = serde_json::from_str(&line)
            .with_context(|| format!("invalid corpus document at line {}", line_no + 1))?;
        documents.push(document);
    }
    Ok(documents)
}

fn load_parquet(path: &Path, limit: Option<usize>) -> Result<Vec<Document>> {
    let file = File::open(path).with_context(|| format!("failed to open corpus {:?}", path))?;
    let rows = metadata::read_title_text(file, limit)
        .with_context(|| format!("failed to read parquet corpus {:?}", path))?;
    Ok(rows
        .into_iter()
        .map(|(title, text)| Document { title, text })
        .collect())
}

fn fetch_hf_rows(query: &HfDatasetQuery, limit: usize) -> Result<Vec<Document>> {
    let client = Client::builder()
        .timeout(query.timeout)
        .build()
        .context("failed to build datasets-server HTTP client")?;
    let endpoint = format!("{}/rows", query.endpoint.trim_end_matches('/'));
    info!(
        dataset = %query.dataset,
        config = %query.config,
        split = %query.split,
        rows = limit,
        "fetching corpus from datasets-server"
    );

    let mut documents = Vec::with_capacity(limit);
    let mut offset = query.offset;
    while documents.len() < limit {
        let length = (limit - documents.len()).min(HF_PAGE_LIMIT);
        let offset_param = offset.to_string();
        let length_param = length.to_string();
        let mut request = client.get(&endpoint).query(&[
            ("dataset", query.dataset.as_str()),
            ("config", query.config.as_str()),
            ("split", query.split.as_str()),
            ("offset", offset_param.as_str()),
            ("length", length_param.as_str()),
        ]);
        if let Some(token) = query.token.as_deref().filter(|t| !t.trim().is_empty()) {
            request = request.bearer_auth(token.trim());
        }
        let resp = request
            .send()
            .with_context(|| format!("failed to call datasets-server at {endpoint}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            anyhow::bail!("datasets-server returned {}: {}", status, body);
        }
        let page: RowsPage = resp
            .json()
            .context("failed to parse datasets-server response")?;
        if page.rows.is_empty() {
            debug!(offset, "datasets-server returned an empty page");
            break;
        }
        offset += page.rows.len();
        for entry in page.rows {
            if !entry.truncated_cells.is_empty() {
                warn!(
                    row = entry.row_idx,
                    cells = ?entry.truncated_cells,
                    "datasets-server truncated row cells"
                );
            }
            documents.push(entry.row);
        }
        debug!(fetched = documents.len(), "fetched corpus page");
    }
    documents.truncate(limit);
    Ok(documents)
}

#[derive(Debug, Deserialize)]
struct RowsPage {
    rows: Vec<RowEntry>,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    #[serde(default)]
    row_idx: usize,
    row: Document,
    #[serde(default)]
    truncated_cells: Vec<String>,
}
