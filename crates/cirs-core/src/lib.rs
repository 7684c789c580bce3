//! Core domain model and request contracts for CIRS.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cirs-core";

/// Display name used when a report carries no usable company name.
pub const UNKNOWN_COMPANY: &str = "unknown entity";

/// Topic label used when a report item carries no usable topic.
pub const DEFAULT_TOPIC: &str = "news";

/// Link text used when a citation carries no usable title.
pub const FALLBACK_SOURCE_TITLE: &str = "view source";

/// Fully-defaulted report model handed to the presenter. Every field is
/// always present; the presenter never needs to null-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalReport {
    pub company: String,
    pub overview: String,
    pub items: Vec<ReportItem>,
    pub sources: Vec<Source>,
}

impl CanonicalReport {
    /// The near-empty shape a malformed raw report degrades to.
    pub fn empty() -> Self {
        Self {
            company: UNKNOWN_COMPANY.to_string(),
            overview: String::new(),
            items: Vec::new(),
            sources: Vec::new(),
        }
    }
}

/// One chronological/topical entry within a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReportItem {
    pub date: String,
    pub topic: String,
    pub fact: String,
    pub analysis: String,
    pub sources: Vec<SourceMention>,
}

/// Per-item citation reference, prior to report-level deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceMention {
    pub url: String,
    pub title: Option<String>,
}

/// Report-level citation entry: deduplicated, sequentially numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: u32,
    pub title: String,
    pub url: String,
}

/// One upstream generation request, scoped to a single company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportQuery {
    pub company: String,
    pub date: String,
    pub key_words: String,
}

/// Inbound body of `POST /api/generate-report`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportRequest {
    pub companies: Vec<String>,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub key_words: String,
}

impl ReportRequest {
    /// Trims entries, drops empties, and deduplicates preserving first-seen
    /// order. The picker already unions presets and free-text entries; this
    /// re-checks the contract at the server boundary.
    pub fn cleaned_companies(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for raw in &self.companies {
            let name = raw.trim();
            if name.is_empty() || out.iter().any(|c| c == name) {
                continue;
            }
            out.push(name.to_string());
        }
        out
    }

    pub fn queries(&self) -> Vec<ReportQuery> {
        self.cleaned_companies()
            .into_iter()
            .map(|company| ReportQuery {
                company,
                date: self.date.clone(),
                key_words: self.key_words.clone(),
            })
            .collect()
    }
}

/// Outbound envelope of `POST /api/generate-report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResponse {
    pub success: bool,
    pub reports: Vec<CanonicalReport>,
}

/// Per-submission context threaded through upstream calls for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchContext {
    pub run_id: Uuid,
    pub requested_at: DateTime<Utc>,
}

impl SearchContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            requested_at: Utc::now(),
        }
    }
}

impl Default for SearchContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaned_companies_trims_dedups_and_keeps_order() {
        let req = ReportRequest {
            companies: vec![
                " 华为 ".to_string(),
                "腾讯".to_string(),
                "华为".to_string(),
                "".to_string(),
                "   ".to_string(),
                "小米".to_string(),
            ],
            date: String::new(),
            key_words: String::new(),
        };
        assert_eq!(req.cleaned_companies(), vec!["华为", "腾讯", "小米"]);
    }

    #[test]
    fn request_body_defaults_optional_fields() {
        let req: ReportRequest =
            serde_json::from_str(r#"{"companies":["华为"]}"#).expect("parse request");
        assert_eq!(req.date, "");
        assert_eq!(req.key_words, "");
        let queries = req.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].company, "华为");
    }

    #[test]
    fn empty_report_uses_sentinel_company() {
        let report = CanonicalReport::empty();
        assert_eq!(report.company, UNKNOWN_COMPANY);
        assert!(report.overview.is_empty());
        assert!(report.items.is_empty());
        assert!(report.sources.is_empty());
    }
}
