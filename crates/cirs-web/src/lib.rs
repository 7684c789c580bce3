//! Axum + Askama web surface for CIRS.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cirs_core::{ReportRequest, ReportResponse, SearchContext};
use cirs_normalize::normalize_reports;
use cirs_upstream::{generate_batch, FixtureBackend, ReportBackend, UpstreamConfig, WorkflowClient};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "cirs-web";

/// Built-in picker presets, used when no `presets.yaml` is available.
pub const DEFAULT_PRESETS: [&str; 12] = [
    "华为", "腾讯", "字节跳动", "阿里巴巴", "拼多多", "小米", "网易", "美团", "京东", "携程",
    "百度", "快手",
];

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn ReportBackend>,
    pub presets: Vec<String>,
    pub concurrency: usize,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(backend: Arc<dyn ReportBackend>, workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let presets = match load_presets_from_yaml(&workspace_root) {
            Ok(presets) if !presets.is_empty() => presets,
            _ => DEFAULT_PRESETS.iter().map(ToString::to_string).collect(),
        };
        Self {
            backend,
            presets,
            concurrency: 4,
            workspace_root,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PresetsYaml {
    presets: Vec<String>,
}

fn load_presets_from_yaml(workspace_root: &Path) -> anyhow::Result<Vec<String>> {
    let path = workspace_root.join("presets.yaml");
    let yaml = std::fs::read_to_string(&path)?;
    let parsed: PresetsYaml = serde_yaml::from_str(&yaml)?;
    Ok(parsed.presets)
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    presets: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/generate-report", post(generate_report_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .route("/assets/static/app.js", get(app_js_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CIRS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = UpstreamConfig::from_env();
    let backend: Arc<dyn ReportBackend> = if config.api_key.is_empty() {
        tracing::warn!("CIRS_UPSTREAM_API_KEY not set; serving canned reports from fixtures/reports");
        Arc::new(FixtureBackend::from_dir("fixtures/reports").unwrap_or_default())
    } else {
        Arc::new(WorkflowClient::new(&config)?)
    };
    let state = AppState::new(backend, ".").with_concurrency(config.concurrency);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    render_html(IndexTemplate {
        presets: state.presets.clone(),
    })
}

/// One search submission: fan out per-company generation, normalize, respond.
/// Empty selections are rejected before any upstream call is made.
async fn generate_report_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReportRequest>,
) -> Response {
    let queries = request.queries();
    if queries.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"detail": "select at least one company"})),
        )
            .into_response();
    }

    let ctx = SearchContext::new();
    let span = info_span!("generate_report", run_id = %ctx.run_id, companies = queries.len());
    let raw = generate_batch(Arc::clone(&state.backend), ctx, queries, state.concurrency)
        .instrument(span)
        .await;
    let reports = normalize_reports(raw);
    Json(ReportResponse {
        success: true,
        reports,
    })
    .into_response()
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    serve_static_text(&state.workspace_root, "assets/static/app.css", "text/css; charset=utf-8", "/* missing app.css */").await
}

async fn app_js_handler(State(state): State<Arc<AppState>>) -> Response {
    serve_static_text(
        &state.workspace_root,
        "assets/static/app.js",
        "text/javascript; charset=utf-8",
        "/* missing app.js */",
    )
    .await
}

async fn serve_static_text(
    workspace_root: &Path,
    relative: &str,
    content_type: &'static str,
    missing_stub: &'static str,
) -> Response {
    let path = workspace_root.join(relative);
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html(missing_stub.to_string())).into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use cirs_upstream::{FixtureBackend, UpstreamError};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    /// Wraps a backend and counts calls, to prove empty selections never
    /// reach the upstream.
    struct CountingBackend {
        inner: FixtureBackend,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ReportBackend for CountingBackend {
        async fn generate(
            &self,
            ctx: &SearchContext,
            query: &cirs_core::ReportQuery,
        ) -> Result<Value, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.generate(ctx, query).await
        }
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn test_state(backend: impl ReportBackend + 'static) -> AppState {
        AppState::new(Arc::new(backend), workspace_root())
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn index_renders_presets() {
        let app = app(test_state(FixtureBackend::new()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("华为"));
        assert!(text.contains("generate-report") || text.contains("app.js"));
    }

    #[tokio::test]
    async fn empty_selection_is_rejected_before_any_upstream_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = CountingBackend {
            inner: FixtureBackend::new(),
            calls: Arc::clone(&calls),
        };
        let app = app(test_state(backend));

        let (status, body) = post_json(
            app,
            "/api/generate-report",
            json!({"companies": ["", "   "]}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "select at least one company");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generate_report_normalizes_wrapped_payloads() {
        let backend = FixtureBackend::new()
            .with_response("腾讯", json!({"text1": "```json\n{\"company\":\"腾讯\"}\n```"}));
        let app = app(test_state(backend));

        let (status, body) = post_json(
            app,
            "/api/generate-report",
            json!({"companies": ["腾讯"], "date": "", "key_words": ""}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let reports = body["reports"].as_array().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0]["company"], "腾讯");
        assert_eq!(reports[0]["overview"], "");
        assert_eq!(reports[0]["items"], json!([]));
        assert_eq!(reports[0]["sources"], json!([]));
    }

    #[tokio::test]
    async fn duplicate_companies_collapse_to_one_report_each() {
        let backend = FixtureBackend::new()
            .with_response("华为", json!({"company": "华为", "overview": "o"}))
            .with_response("小米", json!({"company": "小米"}));
        let app = app(test_state(backend));

        let (status, body) = post_json(
            app,
            "/api/generate-report",
            json!({"companies": ["华为", " 华为 ", "小米"]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let reports = body["reports"].as_array().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0]["company"], "华为");
        assert_eq!(reports[1]["company"], "小米");
    }

    #[tokio::test]
    async fn failed_company_surfaces_as_failure_report_not_error() {
        let backend = FixtureBackend::new()
            .with_response("ok", json!({"company": "ok"}))
            .with_failure("down");
        let app = app(test_state(backend));

        let (status, body) = post_json(
            app,
            "/api/generate-report",
            json!({"companies": ["ok", "down"]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let reports = body["reports"].as_array().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1]["company"], "down");
        assert!(reports[1]["overview"]
            .as_str()
            .unwrap()
            .starts_with("search failed:"));
    }

    #[tokio::test]
    async fn static_assets_are_served() {
        let app = app(test_state(FixtureBackend::new()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/assets/static/app.js")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/javascript; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn missing_asset_returns_stub_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(Arc::new(FixtureBackend::new()), dir.path());
        let app = app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/assets/static/app.css")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn presets_load_from_workspace_yaml() {
        let presets = load_presets_from_yaml(&workspace_root()).expect("presets.yaml");
        assert!(presets.contains(&"华为".to_string()));
    }
}
