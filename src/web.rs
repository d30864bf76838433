//! HTTP front end: the question form, a JSON query API and a health probe.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::query::{truncate_chars, Answer, QueryService, RetrievedPassage};

/// Passages retrieved for a form submission.
const FORM_TOP_K: usize = 5;
/// Characters of each passage shown on the page.
const PAGE_PASSAGE_CHARS: usize = 800;

/// Router state shared by every handler.
#[derive(Clone)]
pub struct AppState {
    service: Arc<QueryService>,
    default_top_k: usize,
    max_top_k: usize,
}

impl AppState {
    /// Wraps a service; `top_k` values from the API are clamped to `[1, max_top_k]`.
    pub fn new(service: Arc<QueryService>, default_top_k: usize, max_top_k: usize) -> Self {
        let max_top_k = max_top_k.max(1);
        Self {
            service,
            default_top_k: default_top_k.clamp(1, max_top_k),
            max_top_k,
        }
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home).post(ask_form))
        .route("/v1/query", post(query_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serves until Ctrl-C.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn home() -> Html<String> {
    Html(render_page(None))
}

#[derive(Debug, Deserialize)]
struct AskForm {
    #[serde(default)]
    query: String,
}

async fn ask_form(State(state): State<AppState>, Form(form): Form<AskForm>) -> Html<String> {
    let question = form.query.trim().to_string();
    if question.is_empty() {
        return Html(render_page(None));
    }
    let page = match run_query(Arc::clone(&state.service), question.clone(), FORM_TOP_K).await {
        Ok(answer) => render_page(Some(PageResult {
            question: &question,
            answer: &answer.text,
            passages: &answer.passages,
        })),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "form query failed");
            let message = format!("[query error] {err:#}");
            render_page(Some(PageResult {
                question: &question,
                answer: &message,
                passages: &[],
            }))
        }
    };
    Html(page)
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    answer: String,
    passages: Vec<RetrievedPassage>,
    meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
struct ResponseMeta {
    top_k: usize,
    latency_ms: f64,
    generation_failed: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, Json<ErrorBody>)> {
    let question = request.query.trim();
    if question.is_empty() {
        return Err(bad_request("query text must not be empty"));
    }
    let top_k = request
        .top_k
        .unwrap_or(state.default_top_k)
        .clamp(1, state.max_top_k);
    let start = Instant::now();
    let answer = run_query(Arc::clone(&state.service), question.to_string(), top_k)
        .await
        .map_err(internal_error)?;
    Ok(Json(QueryResponse {
        answer: answer.text,
        passages: answer.passages,
        meta: ResponseMeta {
            top_k,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            generation_failed: answer.generation_failed,
        },
    }))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn internal_error(err: anyhow::Error) -> (StatusCode, Json<ErrorBody>) {
    warn!(error = %format!("{err:#}"), "query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            message: format!("{err:#}"),
        }),
    )
}

// Embedding and generation use blocking clients.
async fn run_query(service: Arc<QueryService>, question: String, k: usize) -> Result<Answer> {
    tokio::task::spawn_blocking(move || service.answer(&question, k))
        .await
        .map_err(|err| anyhow!("query task join error: {err}"))?
}

/// What the page shows below the form after a submission.
#[derive(Debug, Clone, Copy)]
pub struct PageResult<'a> {
    /// The submitted question.
    pub question: &'a str,
    /// Answer text or error message.
    pub answer: &'a str,
    /// Retrieved passages, closest first.
    pub passages: &'a [RetrievedPassage],
}

/// Renders the form page, with an answer card when `result` is set.
pub fn render_page(result: Option<PageResult<'_>>) -> String {
    let mut html = String::with_capacity(8 * 1024);
    html.push_str(PAGE_HEAD);
    html.push_str(QUESTION_FORM);
    if let Some(result) = result {
        push_answer_card(&mut html, &result);
        push_passages(&mut html, result.passages);
    }
    html.push_str(PAGE_TAIL);
    html
}

fn push_answer_card(html: &mut String, result: &PageResult<'_>) {
    html.push_str(
        "<div class=\"card mb-3\">\n<div class=\"card-header bg-success text-white\"><strong>Answer</strong></div>\n<div class=\"card-body\">\n",
    );
    html.push_str("<p class=\"text-muted small\">");
    html.push_str(&html_escape::encode_text(result.question));
    html.push_str("</p>\n<p>");
    html.push_str(&html_escape::encode_text(result.answer));
    html.push_str("</p>\n");
    if !result.passages.is_empty() {
        html.push_str(PASSAGE_BUTTONS);
    }
    html.push_str(ANOTHER_QUESTION_FORM);
    html.push_str("</div>\n</div>\n");
}

fn push_passages(html: &mut String, passages: &[RetrievedPassage]) {
    if passages.is_empty() {
        return;
    }
    html.push_str(&format!(
        "<div id=\"passage-container\" style=\"display:none;\">\n<div class=\"card mb-3\">\n<div class=\"card-header bg-info text-white\"><strong>Retrieved Passages (top {})</strong></div>\n<div class=\"card-body\">\n",
        passages.len()
    ));
    for (rank, passage) in passages.iter().enumerate() {
        let shown = truncate_chars(&passage.text, PAGE_PASSAGE_CHARS);
        let ellipsis = if shown.len() < passage.text.len() { "..." } else { "" };
        html.push_str(&format!(
            "<div class=\"retrieved-passage passage\" style=\"display:none;\">\n<div class=\"passage-title\">{}. {}</div>\n<div class=\"passage-text\">{}{}</div>\n<hr/>\n</div>\n",
            rank + 1,
            html_escape::encode_text(&passage.title),
            html_escape::encode_text(shown),
            ellipsis
        ));
    }
    html.push_str(
        "<div class=\"text-muted small\">Showing only the number of passages you request.</div>\n</div>\n</div>\n</div>\n",
    );
}

const PAGE_HEAD: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Wikipedia RAG Assistant</title>
<link href="https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css" rel="stylesheet">
<style>
body{padding:30px;background-color:#f8f9fa;}
.card{box-shadow:0 4px 10px rgba(0,0,0,0.08);}
.passage{margin-bottom:10px;}
.passage-title{font-weight:600;}
</style>
<script>
function showPassages(n){
  const container = document.getElementById('passage-container');
  if(!container) return;
  container.style.display = 'block';
  container.querySelectorAll('.retrieved-passage').forEach((item, idx) => {
    item.style.display = (idx < n) ? 'block' : 'none';
  });
  container.scrollIntoView({behavior:'smooth', block:'start'});
}
function hidePassages(){
  const container = document.getElementById('passage-container');
  if(container) container.style.display = 'none';
}
</script>
</head>
<body>
<div class="container">
<h2 class="mb-3 text-primary">Wikipedia RAG Assistant</h2>
<p class="text-muted">Ask a question and get a short answer. Use the buttons to view the top 3 or top 5 retrieved passages.</p>
"#;

const QUESTION_FORM: &str = r#"<form method="post" action="/" class="mb-3">
<div class="input-group">
<input type="text" name="query" class="form-control" placeholder="Ask a question" required>
<button type="submit" class="btn btn-primary">Ask</button>
</div>
</form>
"#;

const PASSAGE_BUTTONS: &str = r#"<div class="mb-2">
<button type="button" class="btn btn-sm btn-outline-primary" onclick="showPassages(3)">Show top 3 passages</button>
<button type="button" class="btn btn-sm btn-outline-secondary" onclick="showPassages(5)">Show top 5 passages</button>
<button type="button" class="btn btn-sm btn-outline-danger" onclick="hidePassages()">Hide passages</button>
</div>
"#;

const ANOTHER_QUESTION_FORM: &str = r#"<form method="post" action="/" class="mt-3">
<div class="input-group">
<input type="text" name="query" class="form-control" placeholder="Ask another question..." required>
<button type="submit" class="btn btn-outline-primary">Ask</button>
</div>
</form>
"#;

const PAGE_TAIL: &str = r#"<footer class="mt-4"><small>Powered by a Wikipedia subset and an instruction-tuned LLM</small></footer>
</div>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::DEFAULT_TOP_K;
    use crate::testing::{dog_car_service, CannedProvider, FailingProvider};
    use pretty_assertions::assert_eq;

    fn state(provider: Arc<dyn crate::llm::LlmProvider>) -> AppState {
        AppState::new(Arc::new(dog_car_service(provider)), DEFAULT_TOP_K, 12)
    }

    fn passage(title: &str, text: &str) -> RetrievedPassage {
        RetrievedPassage {
            ordinal: 0,
            title: title.into(),
            text: text.into(),
            distance: 0.0,
        }
    }

    #[test]
    fn empty_page_has_form_but_no_answer() {
        let html = render_page(None);
        assert!(html.contains("name=\"query\""));
        assert!(!html.contains("id=\"passage-container\""));
        assert!(!html.contains("<strong>Answer</strong>"));
    }

    #[test]
    fn user_and_corpus_text_is_escaped() {
        let passages = [passage("<b>Dog</b>", "Dogs & <script>alert(1)</script>")];
        let html = render_page(Some(PageResult {
            question: "<img src=x onerror=alert(1)>",
            answer: "a < b",
            passages: &passages,
        }));
        assert!(!html.contains("<img src=x"));
        assert!(!html.contains("<script>alert(1)</script>"));
        assert!(html.contains("&lt;b&gt;Dog&lt;/b&gt;"));
        assert!(html.contains("Dogs &amp; &lt;script&gt;"));
        assert!(html.contains("a &lt; b"));
    }

    #[test]
    fn long_passages_are_truncated_with_ellipsis() {
        let long = "y".repeat(PAGE_PASSAGE_CHARS + 50);
        let passages = [passage("Long", &long), passage("Short", "short text")];
        let html = render_page(Some(PageResult {
            question: "q",
            answer: "a",
            passages: &passages,
        }));
        let expected = format!("{}...</div>", "y".repeat(PAGE_PASSAGE_CHARS));
        assert!(html.contains(&expected));
        assert!(html.contains("short text</div>"));
        assert!(html.contains("Retrieved Passages (top 2)"));
        assert!(html.contains("showPassages(3)"));
        assert!(html.contains("showPassages(5)"));
    }

    #[tokio::test]
    async fn form_submission_renders_answer_and_passages() {
        let state = state(Arc::new(CannedProvider::new("Dogs bark.")));
        let Html(html) = ask_form(
            State(state),
            Form(AskForm {
                query: "  Do dogs bark?  ".into(),
            }),
        )
        .await;
        assert!(html.contains("<p>Dogs bark.</p>"));
        assert!(html.contains("1. Dog"));
        assert!(html.contains("2. Car"));
    }

    #[tokio::test]
    async fn blank_form_submission_renders_plain_page() {
        let state = state(Arc::new(CannedProvider::new("unused")));
        let Html(html) = ask_form(State(state), Form(AskForm { query: "   ".into() })).await;
        assert_eq!(html, render_page(None));
    }

    #[tokio::test]
    async fn api_clamps_top_k_and_reports_llm_errors() {
        let state = state(Arc::new(FailingProvider));
        let Json(response) = query_handler(
            State(state),
            Json(QueryRequest {
                query: "engines and wheels".into(),
                top_k: Some(0),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.meta.top_k, 1);
        assert!(response.meta.generation_failed);
        assert!(response.answer.starts_with("[LLM error]"));
        assert_eq!(response.passages.len(), 1);
        assert_eq!(response.passages[0].title, "Car");
    }

    #[tokio::test]
    async fn api_rejects_empty_query() {
        let state = state(Arc::new(CannedProvider::new("unused")));
        let (status, Json(body)) = query_handler(
            State(state),
            Json(QueryRequest {
                query: " ".into(),
                top_k: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.message, "query text must not be empty");
    }

    #[tokio::test]
    async fn api_serializes_expected_shape() {
        let state = state(Arc::new(CannedProvider::new("Cars have engines.")));
        let Json(response) = query_handler(
            State(state),
            Json(QueryRequest {
                query: "car".into(),
                top_k: Some(50),
            }),
        )
        .await
        .unwrap();
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["answer"], "Cars have engines.");
        assert_eq!(value["meta"]["top_k"], 12);
        assert_eq!(value["passages"].as_array().unwrap().len(), 2);
        assert_eq!(value["passages"][0]["ordinal"], 1);
        assert_eq!(value["passages"][0]["title"], "Car");
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        assert_eq!(healthz().await, StatusCode::OK);
    }
}
