use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use wikirag::query::DEFAULT_TOP_K;
use wikirag::settings::ServiceArgs;
use wikirag::web::{self, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "wikirag-serve",
    about = "Serve the Wikipedia question form and JSON query API"
)]
struct ServeCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "WIKIRAG_BIND", default_value = "0.0.0.0:5000")]
    bind: String,

    /// Default top-k when an API client does not override it.
    #[arg(long, env = "WIKIRAG_DEFAULT_TOP_K", default_value_t = DEFAULT_TOP_K)]
    default_top_k: usize,

    /// Maximum top-k allowed per API request.
    #[arg(long, env = "WIKIRAG_MAX_TOP_K", default_value_t = 12)]
    max_top_k: usize,

    /// HTTP worker threads (defaults to one per core).
    #[arg(long, env = "WIKIRAG_SERVER_THREADS")]
    server_threads: Option<usize>,

    #[command(flatten)]
    service: ServiceArgs,
}

fn main() -> Result<()> {
    wikirag::init_tracing();
    let cli = ServeCli::parse();
    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;

    // Blocking HTTP clients are built here, before any runtime exists.
    let provider = cli.service.build_provider()?;
    let service = Arc::new(cli.service.load_service(provider)?);
    let state = AppState::new(Arc::clone(&service), cli.default_top_k, cli.max_top_k);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = cli.server_threads {
        builder.worker_threads(threads.max(1));
    }
    let runtime = builder
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run(addr, state))?;
    drop(runtime);

    // Last reference; the blocking clients must not be dropped on a runtime thread.
    drop(service);
    info!("server stopped");
    Ok(())
}

async fn run(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("wikirag-serve listening on http://{addr}");
    web::serve(listener, state).await
}
