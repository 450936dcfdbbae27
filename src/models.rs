//! Core data models used throughout the ingestion and retrieval pipeline.
//!
//! These types represent projects, documents, chunks, categories, crawl jobs,
//! and agent workflows as they flow between the ingestion worker, the
//! retrieval pipeline, and the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Isolation boundary: every retrievable object belongs to exactly one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// How a document's source content was originally obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Pdf,
    Web,
    Youtube,
    Text,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pdf => "pdf",
            SourceKind::Web => "web",
            SourceKind::Youtube => "youtube",
            SourceKind::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(SourceKind::Pdf),
            "web" => Some(SourceKind::Web),
            "youtube" => Some(SourceKind::Youtube),
            "text" => Some(SourceKind::Text),
            _ => None,
        }
    }
}

/// Lifecycle state of a [`Document`] as it moves through the ingestion worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Processing => "processing",
            ProcessingState::Completed => "completed",
            ProcessingState::Failed => "failed",
        }
    }
}

/// A processed source: a PDF, a crawled web page, a YouTube transcript, or raw text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub project_id: String,
    pub title: Option<String>,
    pub source_kind: String,
    pub source_locator: String,
    pub state: String,
    pub page_count: Option<i64>,
    pub error_message: Option<String>,
    /// Free-form extraction metadata: detected document type, extraction tool,
    /// classification confidence, human-readable reasoning, table-of-contents, etc.
    pub extraction_metadata: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A retrievable text unit belonging to exactly one [`Document`].
///
/// Invariant: `chunk_index` is contiguous (0..N-1) within a document.
/// `before`/`after` are fixed at creation time from physical neighbors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub before: Option<String>,
    pub after: Option<String>,
    /// `{start_char, end_char, length, page_number?}`.
    pub metadata: serde_json::Value,
    pub hash: String,
    pub has_embedding: bool,
}

/// A chunk paired with its embedding vector, as loaded from storage for search.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// A node in a per-project hierarchical category tree. `depth` is 0 at the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub project_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub depth: i64,
    pub sort_order: i64,
    pub source_url: Option<String>,
    pub url_path: Option<String>,
    pub content_hash: Option<String>,
    pub last_crawled_at: Option<i64>,
}

pub const MAX_CATEGORY_DEPTH: i64 = 10;

/// An ingestion task over one or more URLs, driven by the crawler orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: String,
    pub project_id: String,
    pub url: String,
    pub max_depth: i64,
    pub max_pages: i64,
    /// Engine name, or `None` to auto-select (see `engine_select`).
    pub engine: Option<String>,
    pub status: String,
    pub urls_crawled: i64,
    pub urls_failed: i64,
    pub document_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A running or completed agentic task (observe-think-act browser loop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWorkflow {
    pub id: String,
    pub project_id: String,
    pub query: String,
    pub status: String,
    pub config: serde_json::Value,
    pub execution_log: serde_json::Value,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// Generic key/value bag used by components whose schema is deliberately open-ended
/// (per-chunk metadata, classification feature dumps, scrape-engine diagnostics).
pub type ExtraFields = HashMap<String, serde_json::Value>;

/// Format a Unix timestamp as ISO 8601 (`YYYY-MM-DDTHH:MM:SSZ`).
pub fn format_ts_iso(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
