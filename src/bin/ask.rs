use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use wikirag::llm::{LlmProvider, ProviderRequest};
use wikirag::query::{build_prompt, RetrievedPassage, DEFAULT_TOP_K};
use wikirag::settings::ServiceArgs;

#[derive(Parser, Debug)]
#[command(
    name = "wikirag-ask",
    about = "Answer one question from the index, locally or through a running wikirag-serve"
)]
struct AskCli {
    /// Question to answer
    #[arg(long)]
    query: String,

    /// Number of passages to retrieve
    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    top_k: usize,

    /// Query a running server's /v1/query endpoint instead of loading the index
    #[arg(long, env = "WIKIRAG_SERVER_URL")]
    server: Option<String>,

    /// Only print the retrieved passages and prompt (skip the LLM call)
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    #[command(flatten)]
    service: ServiceArgs,
}

fn main() -> Result<()> {
    wikirag::init_tracing();
    let cli = AskCli::parse();
    let question = cli.query.trim();
    if question.is_empty() {
        bail!("--query must not be empty");
    }
    let top_k = cli.top_k.max(1);

    if let Some(server) = cli.server.as_deref() {
        let response = query_server(server, question, top_k)?;
        println!("--- Retrieved Passages ---\n{}", render_passages(&response.passages));
        println!("--- Answer ---\n{}", response.answer);
        return Ok(());
    }

    if cli.dry_run {
        let service = cli.service.load_service(Arc::new(DisabledProvider))?;
        let passages = service.retrieve(question, top_k)?;
        println!("--- Retrieved Passages ---\n{}", render_passages(&passages));
        println!(
            "--- Prompt ---\n{}\n",
            build_prompt(question, &passages, service.settings())
        );
        println!("dry-run enabled; skipping LLM call.");
        return Ok(());
    }

    let provider = cli.service.build_provider()?;
    let service = cli.service.load_service(provider)?;
    let answer = service.answer(question, top_k)?;
    println!("--- Retrieved Passages ---\n{}", render_passages(&answer.passages));
    println!("--- Answer ---\n{}", answer.text);
    Ok(())
}

struct DisabledProvider;

impl LlmProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    fn answer(&self, _request: &ProviderRequest) -> Result<String> {
        bail!("generation is disabled in dry-run mode")
    }
}

fn render_passages(passages: &[RetrievedPassage]) -> String {
    let mut out = String::new();
    for (rank, passage) in passages.iter().enumerate() {
        out.push_str(&format!(
            "{}. {} (ordinal {}, distance {:.4})\n{}\n---\n",
            rank + 1,
            passage.title,
            passage.ordinal,
            passage.distance,
            passage.text.trim()
        ));
    }
    out
}

fn query_server(base: &str, query: &str, top_k: usize) -> Result<ServerResponse> {
    let client = Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .context("failed to build HTTP client")?;
    let url = format!("{}/v1/query", base.trim_end_matches('/'));
    let resp = client
        .post(&url)
        .json(&ServerRequest { query, top_k })
        .send()
        .with_context(|| format!("failed to call {url}"))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp
            .text()
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        bail!("server returned {}: {}", status, body);
    }
    resp.json().context("failed to parse server response")
}

#[derive(Serialize)]
struct ServerRequest<'a> {
    query: &'a str,
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct ServerResponse {
    answer: String,
    passages: Vec<RetrievedPassage>,
}
