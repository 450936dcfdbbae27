//! Configuration parsing and validation.
//!
//! The system is configured via a TOML file (default: `config/kt.toml`). The
//! config defines database path, chunking parameters, embedding/cross-encoder/
//! chat model settings, retrieval pipeline tuning, agentic crawl bounds,
//! scraping engine availability, and the HTTP server bind address.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cross_encoder: CrossEncoderConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub scraping: ScrapingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// RRF dense-side weight. Sparse weight is implicitly `1.0 - dense_weight`
    /// unless both are supplied explicitly via `hybrid_search` call parameters.
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_sparse_weight")]
    pub sparse_weight: f64,
    /// Reciprocal rank fusion constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    #[serde(default = "default_retrieval_limit")]
    pub retrieval_limit: i64,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    /// Floor below which a sparse (BM25) hit is dropped before fusion.
    #[serde(default = "default_min_bm25")]
    pub min_bm25: f64,
    /// Weight given to document recency in the dense-only search's rerank step.
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_true")]
    pub use_query_expansion: bool,
    #[serde(default = "default_expansion_strategy")]
    pub expansion_strategy: String,
    #[serde(default = "default_true")]
    pub use_crag: bool,
    /// Relative gap (top1 - top2) / top1 above which reranking is skipped.
    #[serde(default = "default_skip_gap_ratio")]
    pub optimizer_gap_ratio: f64,
    /// Absolute top-1 score above which reranking is skipped outright.
    #[serde(default = "default_skip_absolute")]
    pub optimizer_absolute_threshold: f64,
    /// stdev/mean ratio of the top-K above which the distribution is considered
    /// spread enough that reranking is unlikely to reorder it materially.
    #[serde(default = "default_skip_spread_ratio")]
    pub optimizer_spread_ratio: f64,
}

fn default_dense_weight() -> f64 {
    0.6
}
fn default_sparse_weight() -> f64 {
    0.4
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_final_limit() -> i64 {
    10
}
fn default_retrieval_limit() -> i64 {
    50
}
fn default_min_similarity() -> f64 {
    0.0
}
fn default_min_bm25() -> f64 {
    0.0
}
fn default_recency_weight() -> f64 {
    0.1
}
fn default_expansion_strategy() -> String {
    "balanced".to_string()
}
fn default_skip_gap_ratio() -> f64 {
    0.4
}
fn default_skip_absolute() -> f64 {
    0.85
}
fn default_skip_spread_ratio() -> f64 {
    0.3
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Character budget for contextual embedding (text + neighbor truncation).
    #[serde(default = "default_embed_char_budget")]
    pub max_context_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            max_context_chars: default_embed_char_budget(),
        }
    }
}

fn default_embed_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_embed_char_budget() -> usize {
    6000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrossEncoderConfig {
    #[serde(default = "default_ce_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_min_ce_score")]
    pub min_score: f64,
}

impl Default for CrossEncoderConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            min_score: default_min_ce_score(),
        }
    }
}

fn default_ce_provider() -> String {
    "disabled".to_string()
}
fn default_min_ce_score() -> f64 {
    0.0
}

impl CrossEncoderConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_chat_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_context_chunks")]
    pub max_context_chunks: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            temperature: default_chat_temperature(),
            max_context_chunks: default_max_context_chunks(),
        }
    }
}

fn default_chat_provider() -> String {
    "disabled".to_string()
}
fn default_chat_temperature() -> f64 {
    0.3
}
fn default_max_context_chunks() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: i64,
    #[serde(default = "default_max_pages")]
    pub max_pages: i64,
    #[serde(default = "default_politeness_ms")]
    pub politeness_delay_ms: u64,
    /// Soft cap on the fraction of pages that may request a vision-capable fetch.
    #[serde(default = "default_vision_quota")]
    pub vision_quota: f64,
    /// Tolerance above `vision_quota` before the quota is actually enforced.
    #[serde(default = "default_vision_quota_tolerance")]
    pub vision_quota_tolerance: f64,
    #[serde(default = "default_max_nav_targets")]
    pub max_nav_targets_per_step: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_pages: default_max_pages(),
            politeness_delay_ms: default_politeness_ms(),
            vision_quota: default_vision_quota(),
            vision_quota_tolerance: default_vision_quota_tolerance(),
            max_nav_targets_per_step: default_max_nav_targets(),
        }
    }
}

fn default_max_depth() -> i64 {
    3
}
fn default_max_pages() -> i64 {
    20
}
fn default_politeness_ms() -> u64 {
    500
}
fn default_vision_quota() -> f64 {
    0.30
}
fn default_vision_quota_tolerance() -> f64 {
    0.05
}
fn default_max_nav_targets() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ScrapingConfig {
    #[serde(default)]
    pub managed_api_key: Option<String>,
    #[serde(default)]
    pub managed_base_url: Option<String>,
    #[serde(default = "default_true")]
    pub headless_enabled: bool,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_fetches: usize,
}

fn default_concurrency() -> usize {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunk_size");
    }

    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.recency_weight) {
        anyhow::bail!("retrieval.recency_weight must be in [0.0, 1.0]");
    }

    if config.embedding.is_enabled()
        && (config.embedding.dims.is_none() || config.embedding.dims == Some(0))
    {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!("Unknown embedding provider: '{}'", other),
    }

    if !(0.0..=1.0).contains(&config.agent.vision_quota) {
        anyhow::bail!("agent.vision_quota must be in [0.0, 1.0]");
    }

    Ok(config)
}
