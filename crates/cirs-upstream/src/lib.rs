//! Report-generation backend client: workflow API contract + fixture-backed stub.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cirs_core::{ReportQuery, SearchContext};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "cirs-upstream";

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
}

impl UpstreamConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("CIRS_UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://api.dify.ai/v1".to_string()),
            api_key: std::env::var("CIRS_UPSTREAM_API_KEY").unwrap_or_default(),
            timeout: Duration::from_secs(
                std::env::var("CIRS_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(120),
            ),
            user_agent: std::env::var("CIRS_USER_AGENT").ok(),
            concurrency: std::env::var("CIRS_UPSTREAM_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
        }
    }
}

/// Transport-level failures only: anything that reaches the normalization
/// pipeline is already a value, never an error.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{0}")]
    Unavailable(String),
}

/// One generated report payload per query. Implementations return the raw,
/// shape-unstable upstream value; normalization happens downstream.
#[async_trait]
pub trait ReportBackend: Send + Sync {
    async fn generate(
        &self,
        ctx: &SearchContext,
        query: &ReportQuery,
    ) -> Result<Value, UpstreamError>;
}

/// HTTP client for the blocking workflow-run endpoint. Single attempt per
/// query: a failed exchange is surfaced as a failure state, not retried.
#[derive(Debug)]
pub struct WorkflowClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl WorkflowClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ReportBackend for WorkflowClient {
    async fn generate(
        &self,
        ctx: &SearchContext,
        query: &ReportQuery,
    ) -> Result<Value, UpstreamError> {
        let url = format!("{}/workflows/run", self.base_url);
        let span = info_span!("upstream_generate", run_id = %ctx.run_id, company = %query.company);

        let payload = json!({
            "inputs": {
                "company_name": query.company,
                "date": query.date,
                "key_words": query.key_words,
            },
            "response_mode": "blocking",
            "user": format!("user-{}", query.company),
        });

        async move {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(UpstreamError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body: Value = resp.json().await?;
            Ok(body
                .get("data")
                .and_then(|d| d.get("outputs"))
                .cloned()
                .unwrap_or_else(|| json!({})))
        }
        .instrument(span)
        .await
    }
}

/// Canned backend for tests and offline runs: one raw payload per company,
/// loadable from a directory of `<company>.json` files.
#[derive(Debug, Clone, Default)]
pub struct FixtureBackend {
    responses: HashMap<String, Value>,
    failures: HashSet<String>,
}

impl FixtureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, company: impl Into<String>, raw: Value) -> Self {
        self.responses.insert(company.into(), raw);
        self
    }

    /// Marks a company as unavailable, simulating a transport failure.
    pub fn with_failure(mut self, company: impl Into<String>) -> Self {
        self.failures.insert(company.into());
        self
    }

    pub fn from_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut backend = Self::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("reading fixture directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(company) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let raw: Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            backend.responses.insert(company.to_string(), raw);
        }
        Ok(backend)
    }
}

#[async_trait]
impl ReportBackend for FixtureBackend {
    async fn generate(
        &self,
        _ctx: &SearchContext,
        query: &ReportQuery,
    ) -> Result<Value, UpstreamError> {
        if self.failures.contains(&query.company) {
            return Err(UpstreamError::Unavailable(format!(
                "no upstream available for {}",
                query.company
            )));
        }
        Ok(self
            .responses
            .get(&query.company)
            .cloned()
            .unwrap_or_else(|| empty_raw_report(&query.company)))
    }
}

fn empty_raw_report(company: &str) -> Value {
    json!({
        "company": company,
        "overview": "",
        "items": [],
        "formatted_sources": [],
    })
}

/// Placeholder raw report for a company whose exchange failed; keeps the
/// batch total so normalization still emits one report per query.
pub fn failure_report(company: &str, err: &UpstreamError) -> Value {
    json!({
        "company": company,
        "overview": format!("search failed: {err}"),
        "items": [],
        "formatted_sources": [],
    })
}

/// Fans out one upstream call per query under a concurrency cap and
/// reassembles the raw payloads in submission order. A failed or panicked
/// query degrades to a placeholder report; siblings are unaffected.
pub async fn generate_batch(
    backend: Arc<dyn ReportBackend>,
    ctx: SearchContext,
    queries: Vec<ReportQuery>,
    concurrency: usize,
) -> Vec<Value> {
    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    let companies: Vec<String> = queries.iter().map(|q| q.company.clone()).collect();

    let mut handles = Vec::with_capacity(queries.len());
    for query in queries {
        let backend = Arc::clone(&backend);
        let limit = Arc::clone(&limit);
        handles.push(tokio::spawn(async move {
            let _permit = limit.acquire_owned().await.expect("semaphore not closed");
            match backend.generate(&ctx, &query).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(company = %query.company, %err, "upstream generation failed");
                    failure_report(&query.company, &err)
                }
            }
        }));
    }

    let mut out = Vec::with_capacity(handles.len());
    for (handle, company) in handles.into_iter().zip(companies) {
        match handle.await {
            Ok(raw) => out.push(raw),
            Err(err) => {
                warn!(%company, %err, "upstream generation task aborted");
                out.push(failure_report(
                    &company,
                    &UpstreamError::Unavailable("generation task aborted".to_string()),
                ));
            }
        }
    }
    out
}
