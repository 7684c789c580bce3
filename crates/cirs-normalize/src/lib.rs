//! Response normalization pipeline: unwrap → field defaults → source reconcile.
//!
//! Upstream report payloads arrive in several inconsistent shapes: a
//! canonical-shaped object, an object whose real payload is a fenced JSON
//! string inside a wrapper field, or an object missing optional fields
//! entirely. This crate reconciles all of them into [`CanonicalReport`]
//! before anything reaches the presenter. Every stage is total: malformed
//! input degrades to defaults, never to a panic or an error.

use std::collections::HashSet;

use cirs_core::{
    CanonicalReport, ReportItem, Source, SourceMention, DEFAULT_TOPIC, FALLBACK_SOURCE_TITLE,
    UNKNOWN_COMPANY,
};
use serde_json::Value;
use tracing::warn;

pub const CRATE_NAME: &str = "cirs-normalize";

/// Wrapper carrier fields, in precedence order.
const WRAPPER_FIELDS: [&str; 2] = ["text1", "text"];

// ---------- payload unwrapping ----------

/// Best-effort unwrap of a fenced-JSON wrapper payload.
///
/// If `raw` has a string-typed carrier field, the fences are stripped and the
/// remainder parsed as a JSON object. On any failure the condition is logged
/// and the original value is returned unchanged, so downstream stages always
/// receive something defaultable. The result is either the fully parsed inner
/// object or the original value, never a hybrid.
pub fn unwrap_payload(raw: Value) -> Value {
    let Some((field, carrier)) = wrapper_carrier(&raw) else {
        return raw;
    };
    match parse_fenced_json(carrier) {
        Ok(inner) => inner,
        Err(reason) => {
            warn!(field, %reason, "malformed wrapper payload; keeping raw object");
            raw
        }
    }
}

fn wrapper_carrier(raw: &Value) -> Option<(&'static str, &str)> {
    WRAPPER_FIELDS
        .iter()
        .find_map(|field| raw.get(*field).and_then(Value::as_str).map(|s| (*field, s)))
}

fn parse_fenced_json(carrier: &str) -> Result<Value, String> {
    let text = strip_code_fences(carrier);
    if text.is_empty() {
        return Err("empty wrapper carrier".to_string());
    }
    let inner: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    if !inner.is_object() {
        return Err(format!("inner payload is {}, not an object", type_name(&inner)));
    }
    Ok(inner)
}

/// Strips a leading fence marker (with an optional language tag) and a
/// trailing fence marker, trimming surrounding whitespace.
fn strip_code_fences(text: &str) -> &str {
    let mut text = text.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.split_once('\n') {
            Some((tag, body)) if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) => body,
            _ => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
        };
    }
    text = text.trim();
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------- field defaulting ----------

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Falsy-coalescing variant: absent, null, wrong-typed, and empty strings all
/// collapse to the fallback, matching the original renderer.
fn str_field_or(v: &Value, key: &str, fallback: &str) -> String {
    match v.get(key).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => fallback.to_string(),
    }
}

/// Builds a fully-populated item from a raw item value. Pure and total:
/// missing, null, and wrong-typed fields become their documented defaults.
pub fn item_from_value(v: &Value) -> ReportItem {
    ReportItem {
        date: str_field(v, "date"),
        topic: str_field_or(v, "topic", DEFAULT_TOPIC),
        fact: str_field(v, "fact"),
        analysis: str_field(v, "analysis"),
        sources: mentions_from_value(v.get("sources")),
    }
}

pub fn items_from_value(v: &Value) -> Vec<ReportItem> {
    v.get("items")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(item_from_value).collect())
        .unwrap_or_default()
}

fn mentions_from_value(v: Option<&Value>) -> Vec<SourceMention> {
    v.and_then(Value::as_array)
        .map(|arr| arr.iter().map(mention_from_value).collect())
        .unwrap_or_default()
}

fn mention_from_value(v: &Value) -> SourceMention {
    SourceMention {
        url: str_field(v, "url"),
        title: v.get("title").and_then(Value::as_str).map(ToString::to_string),
    }
}

// ---------- source reconciliation ----------

/// Builds the canonical citation list for one report.
///
/// A non-empty `formatted_sources` array is authoritative: it is used
/// verbatim in array order with no deduplication, filling only missing ids
/// and titles. Otherwise the list is derived from source mentions: a
/// report-level `sources` array when present, else every item's mentions in
/// item order then mention order. First occurrence of a url wins its
/// position; later duplicates are dropped silently; mentions without a url
/// are skipped and never counted.
pub fn reconcile_sources(report: &Value, items: &[ReportItem]) -> Vec<Source> {
    if let Some(formatted) = formatted_sources(report) {
        return formatted;
    }
    let top_level = mentions_from_value(report.get("sources"));
    let mentions: Vec<&SourceMention> = if top_level.is_empty() {
        items.iter().flat_map(|item| item.sources.iter()).collect()
    } else {
        top_level.iter().collect()
    };
    dedup_mentions(&mentions)
}

fn formatted_sources(report: &Value) -> Option<Vec<Source>> {
    let arr = report.get("formatted_sources").and_then(Value::as_array)?;
    if arr.is_empty() {
        return None;
    }
    Some(
        arr.iter()
            .enumerate()
            .map(|(idx, entry)| Source {
                id: entry
                    .get("id")
                    .and_then(|v| v.as_u64())
                    .map(|id| id as u32)
                    .unwrap_or(idx as u32 + 1),
                title: str_field_or(entry, "title", FALLBACK_SOURCE_TITLE),
                url: str_field(entry, "url"),
            })
            .collect(),
    )
}

/// Ordered-set construction over urls: the output vec is the ordered
/// structure, so first-occurrence-wins and `id = position + 1` are explicit
/// invariants rather than iteration-order artifacts.
fn dedup_mentions(mentions: &[&SourceMention]) -> Vec<Source> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out: Vec<Source> = Vec::new();
    for mention in mentions {
        if mention.url.is_empty() || !seen.insert(mention.url.as_str()) {
            continue;
        }
        let title = match mention.title.as_deref() {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => FALLBACK_SOURCE_TITLE.to_string(),
        };
        out.push(Source {
            id: out.len() as u32 + 1,
            title,
            url: mention.url.clone(),
        });
    }
    out
}

// ---------- orchestration ----------

/// Runs one raw report through the full pipeline.
pub fn normalize_report(raw: Value) -> CanonicalReport {
    let unwrapped = unwrap_payload(raw);
    let items = items_from_value(&unwrapped);
    let sources = reconcile_sources(&unwrapped, &items);
    CanonicalReport {
        company: str_field_or(&unwrapped, "company", UNKNOWN_COMPANY),
        overview: str_field(&unwrapped, "overview"),
        items,
        sources,
    }
}

/// Normalizes a batch, preserving order and length: one canonical report per
/// raw report, with per-report fault isolation.
pub fn normalize_reports(raw_reports: Vec<Value>) -> Vec<CanonicalReport> {
    raw_reports.into_iter().map(normalize_report).collect()
}

/// Normalizes a whole response body: reads the `reports` array (absent or
/// wrong-typed is treated as empty) and maps it through the pipeline.
pub fn normalize_response(body: &Value) -> Vec<CanonicalReport> {
    let raw_reports = body
        .get("reports")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    normalize_reports(raw_reports)
}
