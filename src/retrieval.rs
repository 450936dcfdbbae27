//! Hybrid retrieval pipeline: dense + sparse fusion, reranking, query
//! expansion, and corrective retrieval (CRAG).
//!
//! [`PipelineCoordinator`] exposes four distinct entry points rather than one
//! merged call, since callers want different cost/quality tradeoffs:
//!
//! - [`PipelineCoordinator::search`] — dense-only, with a recency-boost
//!   rerank blending similarity and document age. Cheapest; no sparse index
//!   build, no fusion, no cross-encoder.
//! - [`PipelineCoordinator::search_sparse`] — BM25-only.
//! - [`PipelineCoordinator::hybrid_search`] — dense + sparse fused with
//!   Reciprocal Rank Fusion, no reranking or corrective retrieval.
//! - [`PipelineCoordinator::search_with_reranking`] — the full pipeline:
//!   query expansion, dense+sparse+RRF, the reranking-skip optimizer, an
//!   optional cross-encoder pass, and CRAG corrective retrieval.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use sqlx::SqlitePool;

use crate::bm25::Bm25Shard;
use crate::config::Config;
use crate::cross_encoder::{create_cross_encoder_provider, score_pairs};
use crate::embedding::{self, cosine_similarity, create_provider};
use crate::models::format_ts_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Dense,
    Sparse,
    Hybrid,
}

/// CRAG's verdict on a result set, plus the action it prescribes.
#[derive(Debug, Clone, Serialize)]
pub struct CragEvaluation {
    /// `"correct"`, `"ambiguous"`, or `"incorrect"`.
    pub quality_level: String,
    pub confidence_score: f64,
    /// `"none"`, `"drop_low_confidence_tail"`, or `"requery"`.
    pub corrective_action: String,
    pub reasoning: String,
    pub should_apply_correction: bool,
}

/// Before/after counts from applying a CRAG corrective action.
#[derive(Debug, Clone, Serialize)]
pub struct ImprovementMetrics {
    pub original_count: usize,
    pub corrected_count: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SearchResultItem {
    pub chunk_id: String,
    pub document_id: String,
    pub document_filename: String,
    pub chunk_index: i64,
    pub title: Option<String>,
    pub text: String,
    pub score: f64,
    pub source: Option<ResultSource>,
    pub rrf_score: Option<f64>,
    pub dense_score: Option<f64>,
    pub sparse_score: Option<f64>,
    pub cross_encoder_score: Option<f64>,
    pub original_rank: Option<usize>,
    /// `"high"` / `"medium"` / `"low"`, attached by the reranking optimizer.
    pub confidence_level: Option<String>,
    pub crag_evaluation: Option<CragEvaluation>,
    pub explanation: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct FiltersApplied {
    pub limit: i64,
    pub retrieval_limit: Option<i64>,
    pub min_similarity: Option<f64>,
    pub min_bm25: Option<f64>,
    pub min_cross_encoder_score: Option<f64>,
    pub recency_weight: Option<f64>,
    pub dense_weight: Option<f64>,
    pub sparse_weight: Option<f64>,
    pub use_query_expansion: Option<bool>,
    pub expansion_strategy: Option<String>,
    pub use_crag: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PipelineSummary {
    pub stages_run: Vec<String>,
    pub reranked: bool,
    pub corrective_requery: bool,
    pub skipped_reranking: bool,
    pub crag_evaluation: Option<CragEvaluation>,
    pub improvement_metrics: Option<ImprovementMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    pub total_results: usize,
    pub execution_time_ms: u64,
    pub filters_applied: FiltersApplied,
    pub pipeline_summary: Option<PipelineSummary>,
    // Kept at top level too (duplicated into `pipeline_summary` for the full
    // pipeline) since the CLI and earlier clients read these directly.
    pub reranked: bool,
    pub expanded_queries: Vec<String>,
    pub corrective_requery: bool,
}

struct Candidate {
    chunk_id: String,
    document_id: String,
    title: Option<String>,
    document_filename: String,
    chunk_index: i64,
    text: String,
    created_at: i64,
    updated_at: i64,
}

// ============ Query expansion ============

/// Expand a query into up to 3 additional paraphrases/term-variant queries.
/// This is a lightweight heuristic expander (no LLM call): it strips stop
/// words for a "broad" variant and appends common synonyms for a handful of
/// domain-agnostic hedge words, mirroring the cheap expansion strategies a
/// corrective-retrieval frontend typically front-loads before the expensive
/// LLM-backed rewrite.
pub fn expand_query(query: &str, strategy: &str) -> Vec<String> {
    let mut variants = vec![query.to_string()];
    if strategy == "none" {
        return variants;
    }

    let stopwords = [
        "the", "a", "an", "of", "to", "in", "on", "for", "is", "are", "and", "or", "how", "what",
    ];
    let broad: String = query
        .split_whitespace()
        .filter(|w| !stopwords.contains(&w.to_lowercase().as_str()))
        .collect::<Vec<_>>()
        .join(" ");
    if !broad.is_empty() && broad != query {
        variants.push(broad);
    }

    if strategy == "aggressive" {
        variants.push(format!("{} explanation overview", query));
    }

    variants.truncate(3);
    variants
}

// ============ Dense retrieval ============

async fn dense_search(
    pool: &SqlitePool,
    project_id: &str,
    query_embedding: &[f32],
    limit: i64,
) -> sqlx::Result<Vec<(String, f64)>> {
    let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
        r#"
        SELECT cv.chunk_id, cv.embedding
        FROM chunk_vectors cv
        JOIN documents d ON d.id = cv.document_id
        WHERE d.project_id = ?
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    let mut scored: Vec<(String, f64)> = rows
        .into_iter()
        .map(|(chunk_id, blob)| {
            let vec = embedding::blob_to_vec(&blob);
            let sim = cosine_similarity(query_embedding, &vec) as f64;
            (chunk_id, sim)
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit.max(0) as usize);
    Ok(scored)
}

// ============ Reciprocal rank fusion ============

/// Merge two ranked id lists with Reciprocal Rank Fusion.
/// `score = dense_weight / (k + dense_rank) + sparse_weight / (k + sparse_rank)`,
/// where rank is 1-indexed and a list missing an id contributes nothing.
pub fn reciprocal_rank_fusion(
    dense: &[(String, f64)],
    sparse: &[(String, f64)],
    k: f64,
    dense_weight: f64,
    sparse_weight: f64,
) -> Vec<(String, f64)> {
    let mut fused: HashMap<String, f64> = HashMap::new();

    for (rank, (id, _)) in dense.iter().enumerate() {
        *fused.entry(id.clone()).or_insert(0.0) += dense_weight / (k + (rank + 1) as f64);
    }
    for (rank, (id, _)) in sparse.iter().enumerate() {
        *fused.entry(id.clone()).or_insert(0.0) += sparse_weight / (k + (rank + 1) as f64);
    }

    let mut ranked: Vec<(String, f64)> = fused.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

// ============ Reranking-skip optimizer ============

/// Decide whether a fused ranking is confident enough that reranking would
/// not change the outcome. Any one of three signals is sufficient to skip:
/// a large relative gap between the top two scores, an outright high top-1
/// score, or a top-K score distribution too spread out to be reordered by
/// a cross-encoder pass.
pub fn should_skip_reranking(scores: &[f64], config: &Config) -> bool {
    if scores.len() < 2 {
        return true;
    }
    let top1 = scores[0];
    let top2 = scores[1];

    if top1 <= 0.0 {
        return false;
    }

    if top1 >= config.retrieval.optimizer_absolute_threshold {
        return true;
    }

    if (top1 - top2) / top1 >= config.retrieval.optimizer_gap_ratio {
        return true;
    }

    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    if mean > 0.0 {
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let stdev = variance.sqrt();
        if stdev / mean >= config.retrieval.optimizer_spread_ratio {
            return true;
        }
    }

    false
}

/// Confidence tag attached to every result describing how sure the optimizer
/// is that skipping (or not skipping) reranking was the right call: `"high"`
/// when a skip signal fires by a wide margin (gap ratio >= 0.6 or top1 >=
/// 0.9), `"medium"` when a signal fires narrowly, `"low"` otherwise.
pub fn reranking_confidence_level(scores: &[f64], config: &Config) -> String {
    if scores.len() < 2 {
        return "low".to_string();
    }
    let top1 = scores[0];
    let top2 = scores[1];
    let gap_ratio = if top1 > 0.0 { (top1 - top2) / top1 } else { 0.0 };

    if gap_ratio >= 0.6 || top1 >= 0.9 {
        "high".to_string()
    } else if should_skip_reranking(scores, config) {
        "medium".to_string()
    } else {
        "low".to_string()
    }
}

fn explain_result(rrf_score: f64, cross_encoder_score: Option<f64>, rank: usize) -> String {
    match cross_encoder_score {
        Some(ce) => format!(
            "fused rank {} (rrf {:.4}), reranked to cross-encoder score {:.3}",
            rank + 1,
            rrf_score,
            ce
        ),
        None => format!("fused rank {} (rrf {:.4}), reranking skipped", rank + 1, rrf_score),
    }
}

// ============ Recency-boost rerank (dense-only search) ============

/// Blend each candidate's similarity with its normalized document age
/// (1.0 = newest in the candidate set, 0.0 = oldest) per `recency_weight`.
fn apply_recency_boost(candidates: &[Candidate], similarities: &[f64], recency_weight: f64) -> Vec<f64> {
    if candidates.is_empty() {
        return Vec::new();
    }
    let min_created = candidates.iter().map(|c| c.created_at).min().unwrap();
    let max_created = candidates.iter().map(|c| c.created_at).max().unwrap();
    let span = (max_created - min_created).max(1) as f64;

    candidates
        .iter()
        .zip(similarities)
        .map(|(c, &sim)| {
            let age_normalized = (c.created_at - min_created) as f64 / span;
            sim * (1.0 - recency_weight) + age_normalized * recency_weight
        })
        .collect()
}

// ============ CRAG corrective evaluation ============

/// Hook for rewriting a query before a corrective re-query. Defaults to the
/// identity transform; a caller with an LLM available can supply a richer
/// implementation.
pub trait ReformulationHook: Send + Sync {
    fn reformulate(&self, query: &str, weak_results: &[SearchResultItem]) -> String;
}

pub struct IdentityReformulation;

impl ReformulationHook for IdentityReformulation {
    fn reformulate(&self, query: &str, _weak_results: &[SearchResultItem]) -> String {
        query.to_string()
    }
}

/// Evaluate result quality against the configured similarity floor and
/// prescribe a corrective action: `correct` results pass through untouched,
/// `ambiguous` results get their low-confidence tail dropped, and
/// `incorrect` results trigger a full corrective re-query.
pub fn evaluate_crag(results: &[SearchResultItem], min_similarity: f64) -> CragEvaluation {
    if results.is_empty() {
        return CragEvaluation {
            quality_level: "incorrect".to_string(),
            confidence_score: 0.0,
            corrective_action: "requery".to_string(),
            reasoning: "no results returned".to_string(),
            should_apply_correction: true,
        };
    }

    let top = results[0].score;
    let passing = results.iter().filter(|r| r.score >= min_similarity).count();
    let ratio = passing as f64 / results.len() as f64;

    if top >= min_similarity && ratio >= 0.5 {
        CragEvaluation {
            quality_level: "correct".to_string(),
            confidence_score: top.min(1.0),
            corrective_action: "none".to_string(),
            reasoning: format!(
                "top score {:.3} clears the floor {:.3} and {:.0}% of results pass",
                top,
                min_similarity,
                ratio * 100.0
            ),
            should_apply_correction: false,
        }
    } else if top >= min_similarity * 0.5 {
        CragEvaluation {
            quality_level: "ambiguous".to_string(),
            confidence_score: ratio.min(1.0),
            corrective_action: "drop_low_confidence_tail".to_string(),
            reasoning: format!(
                "top score {:.3} clears half the floor but only {:.0}% of results pass",
                top,
                ratio * 100.0
            ),
            should_apply_correction: true,
        }
    } else {
        CragEvaluation {
            quality_level: "incorrect".to_string(),
            confidence_score: 0.0,
            corrective_action: "requery".to_string(),
            reasoning: format!("top score {:.3} falls below half the similarity floor {:.3}", top, min_similarity),
            should_apply_correction: true,
        }
    }
}

/// Apply a CRAG-prescribed corrective action that doesn't require a new
/// retrieval round. `"requery"` is the caller's responsibility (it needs a
/// reformulated query and a fresh pipeline run) so it passes results through
/// unchanged here; `"drop_low_confidence_tail"` filters below the floor.
/// Idempotent: re-running this on its own output is a no-op once nothing
/// left over the threshold.
pub fn apply_crag_correction(
    results: Vec<SearchResultItem>,
    evaluation: &CragEvaluation,
    min_similarity: f64,
) -> (Vec<SearchResultItem>, ImprovementMetrics) {
    let original_count = results.len();
    let corrected = match evaluation.corrective_action.as_str() {
        "drop_low_confidence_tail" => results.into_iter().filter(|r| r.score >= min_similarity).collect(),
        _ => results,
    };
    let corrected_count = corrected.len();
    (corrected, ImprovementMetrics { original_count, corrected_count })
}

fn filename_from_locator(locator: &str) -> String {
    Path::new(locator)
        .file_name()
        .and_then(|f| f.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| locator.to_string())
}

// ============ Pipeline coordinator ============

pub struct PipelineCoordinator<'a> {
    pub pool: &'a SqlitePool,
    pub config: &'a Config,
}

impl<'a> PipelineCoordinator<'a> {
    pub fn new(pool: &'a SqlitePool, config: &'a Config) -> Self {
        Self { pool, config }
    }

    /// Dense-only search with a recency-boost rerank. Drops results below
    /// `retrieval.min_similarity`, then blends similarity with normalized
    /// document age per `retrieval.recency_weight`.
    pub async fn search(&self, project_id: &str, query: &str, limit: i64) -> anyhow::Result<SearchResponse> {
        let started = std::time::Instant::now();
        let retrieval_limit = self.config.retrieval.retrieval_limit;
        let min_similarity = self.config.retrieval.min_similarity;
        let recency_weight = self.config.retrieval.recency_weight;

        let dense = self.dense_only(project_id, query, retrieval_limit).await?;
        let dense: Vec<(String, f64)> = dense.into_iter().filter(|(_, s)| *s >= min_similarity).collect();
        let total_results = dense.len();

        let ids: Vec<String> = dense.iter().map(|(id, _)| id.clone()).collect();
        let mut candidates = self.load_candidates(&ids).await?;
        candidates.sort_by_key(|c| ids.iter().position(|id| id == &c.chunk_id).unwrap_or(usize::MAX));

        let similarities: Vec<f64> = candidates
            .iter()
            .map(|c| dense.iter().find(|(id, _)| id == &c.chunk_id).map(|(_, s)| *s).unwrap_or(0.0))
            .collect();
        let boosted = apply_recency_boost(&candidates, &similarities, recency_weight);

        let mut results: Vec<SearchResultItem> = candidates
            .iter()
            .zip(similarities.iter())
            .zip(boosted.iter())
            .map(|((c, &sim), &boosted_score)| SearchResultItem {
                chunk_id: c.chunk_id.clone(),
                document_id: c.document_id.clone(),
                document_filename: c.document_filename.clone(),
                chunk_index: c.chunk_index,
                title: c.title.clone(),
                text: c.text.clone(),
                score: boosted_score,
                source: Some(ResultSource::Dense),
                dense_score: Some(sim),
                explanation: Some(format!(
                    "dense similarity {:.3} blended with recency weight {:.2}",
                    sim, recency_weight
                )),
                updated_at: format_ts_iso(c.updated_at),
                ..Default::default()
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit.max(0) as usize);

        Ok(SearchResponse {
            results,
            total_results,
            execution_time_ms: started.elapsed().as_millis() as u64,
            filters_applied: FiltersApplied {
                limit,
                retrieval_limit: Some(retrieval_limit),
                min_similarity: Some(min_similarity),
                recency_weight: Some(recency_weight),
                ..Default::default()
            },
            pipeline_summary: Some(PipelineSummary {
                stages_run: vec!["dense".to_string(), "recency_rerank".to_string()],
                ..Default::default()
            }),
            reranked: false,
            expanded_queries: vec![query.to_string()],
            corrective_requery: false,
        })
    }

    /// BM25-only search against the sparse index.
    pub async fn search_sparse(&self, project_id: &str, query: &str, limit: i64) -> anyhow::Result<SearchResponse> {
        let started = std::time::Instant::now();
        let retrieval_limit = self.config.retrieval.retrieval_limit;

        let shard = Bm25Shard::build(self.pool, project_id).await?;
        let sparse = shard.search(query, retrieval_limit as usize);
        let total_results = sparse.len();

        let ids: Vec<String> = sparse.iter().map(|(id, _)| id.clone()).collect();
        let mut candidates = self.load_candidates(&ids).await?;
        candidates.sort_by_key(|c| ids.iter().position(|id| id == &c.chunk_id).unwrap_or(usize::MAX));

        let mut results: Vec<SearchResultItem> = candidates
            .iter()
            .map(|c| {
                let sparse_score = sparse.iter().find(|(id, _)| id == &c.chunk_id).map(|(_, s)| *s).unwrap_or(0.0);
                SearchResultItem {
                    chunk_id: c.chunk_id.clone(),
                    document_id: c.document_id.clone(),
                    document_filename: c.document_filename.clone(),
                    chunk_index: c.chunk_index,
                    title: c.title.clone(),
                    text: c.text.clone(),
                    score: sparse_score,
                    source: Some(ResultSource::Sparse),
                    sparse_score: Some(sparse_score),
                    explanation: Some(format!("BM25 score {:.3}", sparse_score)),
                    updated_at: format_ts_iso(c.updated_at),
                    ..Default::default()
                }
            })
            .collect();

        results.truncate(limit.max(0) as usize);

        Ok(SearchResponse {
            results,
            total_results,
            execution_time_ms: started.elapsed().as_millis() as u64,
            filters_applied: FiltersApplied {
                limit,
                retrieval_limit: Some(retrieval_limit),
                ..Default::default()
            },
            pipeline_summary: Some(PipelineSummary {
                stages_run: vec!["sparse".to_string()],
                ..Default::default()
            }),
            reranked: false,
            expanded_queries: vec![query.to_string()],
            corrective_requery: false,
        })
    }

    /// Dense + sparse fused with Reciprocal Rank Fusion; no reranking, no CRAG.
    pub async fn hybrid_search(&self, project_id: &str, query: &str, limit: i64) -> anyhow::Result<SearchResponse> {
        let started = std::time::Instant::now();
        let retrieval_limit = self.config.retrieval.retrieval_limit;
        let min_similarity = self.config.retrieval.min_similarity;
        let min_bm25 = self.config.retrieval.min_bm25;

        let dense = self.dense_only(project_id, query, retrieval_limit).await?;
        let dense: Vec<(String, f64)> = dense.into_iter().filter(|(_, s)| *s >= min_similarity).collect();

        let shard = Bm25Shard::build(self.pool, project_id).await?;
        let sparse: Vec<(String, f64)> = shard
            .search(query, retrieval_limit as usize)
            .into_iter()
            .filter(|(_, s)| *s >= min_bm25)
            .collect();

        let fused = reciprocal_rank_fusion(
            &dense,
            &sparse,
            self.config.retrieval.rrf_k,
            self.config.retrieval.dense_weight,
            self.config.retrieval.sparse_weight,
        );
        let total_results = fused.len();

        let top_ids: Vec<String> = fused.iter().take(retrieval_limit as usize).map(|(id, _)| id.clone()).collect();
        let dense_lookup: HashMap<&str, f64> = dense.iter().map(|(id, s)| (id.as_str(), *s)).collect();
        let sparse_lookup: HashMap<&str, f64> = sparse.iter().map(|(id, s)| (id.as_str(), *s)).collect();

        let mut candidates = self.load_candidates(&top_ids).await?;
        candidates.sort_by_key(|c| top_ids.iter().position(|id| id == &c.chunk_id).unwrap_or(usize::MAX));

        let mut results: Vec<SearchResultItem> = candidates
            .iter()
            .enumerate()
            .map(|(rank, c)| {
                let rrf_score = fused.iter().find(|(id, _)| id == &c.chunk_id).map(|(_, s)| *s).unwrap_or(0.0);
                SearchResultItem {
                    chunk_id: c.chunk_id.clone(),
                    document_id: c.document_id.clone(),
                    document_filename: c.document_filename.clone(),
                    chunk_index: c.chunk_index,
                    title: c.title.clone(),
                    text: c.text.clone(),
                    score: rrf_score,
                    source: Some(ResultSource::Hybrid),
                    rrf_score: Some(rrf_score),
                    dense_score: dense_lookup.get(c.chunk_id.as_str()).copied(),
                    sparse_score: sparse_lookup.get(c.chunk_id.as_str()).copied(),
                    original_rank: Some(rank + 1),
                    explanation: Some(format!("RRF fusion rank {}", rank + 1)),
                    updated_at: format_ts_iso(c.updated_at),
                    ..Default::default()
                }
            })
            .collect();

        results.truncate(limit.max(0) as usize);

        Ok(SearchResponse {
            results,
            total_results,
            execution_time_ms: started.elapsed().as_millis() as u64,
            filters_applied: FiltersApplied {
                limit,
                retrieval_limit: Some(retrieval_limit),
                min_similarity: Some(min_similarity),
                min_bm25: Some(min_bm25),
                dense_weight: Some(self.config.retrieval.dense_weight),
                sparse_weight: Some(self.config.retrieval.sparse_weight),
                ..Default::default()
            },
            pipeline_summary: Some(PipelineSummary {
                stages_run: vec!["dense".to_string(), "sparse".to_string(), "rrf".to_string()],
                ..Default::default()
            }),
            reranked: false,
            expanded_queries: vec![query.to_string()],
            corrective_requery: false,
        })
    }

    /// Full pipeline: query expansion, dense+sparse+RRF, the reranking-skip
    /// optimizer with an optional cross-encoder pass, and CRAG corrective
    /// retrieval.
    pub async fn search_with_reranking(
        &self,
        project_id: &str,
        query: &str,
        limit: i64,
        reformulation: &dyn ReformulationHook,
    ) -> anyhow::Result<SearchResponse> {
        let started = std::time::Instant::now();
        let expansion_strategy = if self.config.retrieval.use_query_expansion {
            self.config.retrieval.expansion_strategy.as_str()
        } else {
            "none"
        };
        let expanded = expand_query(query, expansion_strategy);

        let (mut response, evaluation) = self.run_once(project_id, query, &expanded, limit).await?;

        let mut corrective = false;
        let mut improvement_metrics = None;
        if self.config.retrieval.use_crag && evaluation.should_apply_correction {
            match evaluation.corrective_action.as_str() {
                "requery" => {
                    let new_query = reformulation.reformulate(query, &response.results);
                    if new_query != query {
                        let original_count = response.results.len();
                        let requeried = expand_query(&new_query, expansion_strategy);
                        let (retry, _) = self.run_once(project_id, &new_query, &requeried, limit).await?;
                        improvement_metrics = Some(ImprovementMetrics {
                            original_count,
                            corrected_count: retry.results.len(),
                        });
                        response = retry;
                        corrective = true;
                    }
                }
                "drop_low_confidence_tail" => {
                    let (corrected, metrics) =
                        apply_crag_correction(response.results.clone(), &evaluation, self.config.retrieval.min_similarity);
                    response.results = corrected;
                    improvement_metrics = Some(metrics);
                }
                _ => {}
            }
        }

        response.corrective_requery = corrective;
        response.expanded_queries = expanded;
        response.execution_time_ms = started.elapsed().as_millis() as u64;
        for r in response.results.iter_mut() {
            r.crag_evaluation = Some(evaluation.clone());
        }
        if let Some(summary) = response.pipeline_summary.as_mut() {
            summary.corrective_requery = corrective;
            summary.crag_evaluation = Some(evaluation.clone());
            summary.improvement_metrics = improvement_metrics;
        }
        Ok(response)
    }

    /// Dense retrieval helper shared by [`Self::search`] and [`Self::hybrid_search`].
    async fn dense_only(&self, project_id: &str, query: &str, retrieval_limit: i64) -> anyhow::Result<Vec<(String, f64)>> {
        let provider = create_provider(&self.config.embedding).ok();
        if let Some(provider) = provider.as_deref() {
            if self.config.embedding.is_enabled() {
                match embedding::embed_query(provider, &self.config.embedding, query).await {
                    Ok(v) => return Ok(dense_search(self.pool, project_id, &v, retrieval_limit).await?),
                    Err(_) => return Ok(Vec::new()),
                }
            }
        }
        Ok(Vec::new())
    }

    async fn run_once(
        &self,
        project_id: &str,
        query: &str,
        expanded_queries: &[String],
        limit: i64,
    ) -> anyhow::Result<(SearchResponse, CragEvaluation)> {
        let retrieval_limit = self.config.retrieval.retrieval_limit;
        let min_similarity = self.config.retrieval.min_similarity;

        let shard = Bm25Shard::build(self.pool, project_id).await?;
        let mut sparse_map: HashMap<String, f64> = HashMap::new();
        for q in expanded_queries {
            for (id, score) in shard.search(q, retrieval_limit as usize) {
                let entry = sparse_map.entry(id).or_insert(0.0);
                if score > *entry {
                    *entry = score;
                }
            }
        }
        let mut sparse: Vec<(String, f64)> = sparse_map.into_iter().collect();
        sparse.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        sparse.truncate(retrieval_limit as usize);

        let dense = self.dense_only(project_id, query, retrieval_limit).await?;
        // Drop below the similarity floor before fusion sees them.
        let dense: Vec<(String, f64)> = dense.into_iter().filter(|(_, s)| *s >= min_similarity).collect();

        let fused = reciprocal_rank_fusion(
            &dense,
            &sparse,
            self.config.retrieval.rrf_k,
            self.config.retrieval.dense_weight,
            self.config.retrieval.sparse_weight,
        );
        let total_results = fused.len();

        let top_ids: Vec<String> = fused.iter().take(retrieval_limit as usize).map(|(id, _)| id.clone()).collect();
        let dense_lookup: HashMap<&str, f64> = dense.iter().map(|(id, s)| (id.as_str(), *s)).collect();
        let sparse_lookup: HashMap<&str, f64> = sparse.iter().map(|(id, s)| (id.as_str(), *s)).collect();

        let mut candidates = self.load_candidates(&top_ids).await?;
        candidates.sort_by_key(|c| top_ids.iter().position(|id| id == &c.chunk_id).unwrap_or(usize::MAX));

        let fused_scores: Vec<f64> = fused.iter().take(candidates.len()).map(|(_, s)| *s).collect();
        let confidence_level = reranking_confidence_level(&fused_scores, self.config);
        let skip_reranking = should_skip_reranking(&fused_scores, self.config);

        let mut reranked = false;
        let cross_encoder_scores = if self.config.cross_encoder.is_enabled() && !skip_reranking {
            let provider = create_cross_encoder_provider(&self.config.cross_encoder)?;
            let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
            match score_pairs(provider.as_ref(), &self.config.cross_encoder, query, &texts).await {
                Ok(scores) => {
                    reranked = true;
                    Some(scores)
                }
                Err(_) => None,
            }
        } else {
            None
        };

        let mut results: Vec<SearchResultItem> = candidates
            .iter()
            .enumerate()
            .map(|(rank, c)| {
                let rrf_score = fused.iter().find(|(id, _)| id == &c.chunk_id).map(|(_, s)| *s).unwrap_or(0.0);
                let cross_encoder_score = cross_encoder_scores.as_ref().map(|s| s[rank]);
                let score = cross_encoder_score.unwrap_or(rrf_score);
                SearchResultItem {
                    chunk_id: c.chunk_id.clone(),
                    document_id: c.document_id.clone(),
                    document_filename: c.document_filename.clone(),
                    chunk_index: c.chunk_index,
                    title: c.title.clone(),
                    text: c.text.clone(),
                    score,
                    source: Some(ResultSource::Hybrid),
                    rrf_score: Some(rrf_score),
                    dense_score: dense_lookup.get(c.chunk_id.as_str()).copied(),
                    sparse_score: sparse_lookup.get(c.chunk_id.as_str()).copied(),
                    cross_encoder_score,
                    original_rank: Some(rank + 1),
                    confidence_level: Some(confidence_level.clone()),
                    explanation: Some(explain_result(rrf_score, cross_encoder_score, rank)),
                    updated_at: format_ts_iso(c.updated_at),
                    ..Default::default()
                }
            })
            .collect();

        // A reranked result below the cross-encoder floor is dropped; results
        // that were never reranked (optimizer skipped, or no provider) have
        // no cross_encoder_score and pass through untouched.
        if reranked {
            let floor = self.config.cross_encoder.min_score;
            results.retain(|r| r.cross_encoder_score.map(|s| s >= floor).unwrap_or(true));
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit.max(0) as usize);

        let evaluation = evaluate_crag(&results, min_similarity);

        Ok((
            SearchResponse {
                results,
                total_results,
                execution_time_ms: 0,
                filters_applied: FiltersApplied {
                    limit,
                    retrieval_limit: Some(retrieval_limit),
                    min_similarity: Some(min_similarity),
                    min_cross_encoder_score: Some(self.config.cross_encoder.min_score),
                    dense_weight: Some(self.config.retrieval.dense_weight),
                    sparse_weight: Some(self.config.retrieval.sparse_weight),
                    use_query_expansion: Some(self.config.retrieval.use_query_expansion),
                    expansion_strategy: Some(self.config.retrieval.expansion_strategy.clone()),
                    use_crag: Some(self.config.retrieval.use_crag),
                    ..Default::default()
                },
                pipeline_summary: Some(PipelineSummary {
                    stages_run: vec![
                        "dense".to_string(),
                        "sparse".to_string(),
                        "rrf".to_string(),
                        "rerank".to_string(),
                        "crag".to_string(),
                    ],
                    reranked,
                    corrective_requery: false,
                    skipped_reranking: skip_reranking,
                    crag_evaluation: None,
                    improvement_metrics: None,
                }),
                reranked,
                expanded_queries: expanded_queries.to_vec(),
                corrective_requery: false,
            },
            evaluation,
        ))
    }

    async fn load_candidates(&self, chunk_ids: &[String]) -> sqlx::Result<Vec<Candidate>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = chunk_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            r#"
            SELECT c.id, c.document_id, d.title, d.source_locator, c.chunk_index, c.text, d.created_at, d.updated_at
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.id IN ({})
            "#,
            placeholders
        );
        let mut q = sqlx::query_as::<_, (String, String, Option<String>, String, i64, String, i64, i64)>(&sql);
        for id in chunk_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(chunk_id, document_id, title, source_locator, chunk_index, text, created_at, updated_at)| Candidate {
                chunk_id,
                document_id,
                title,
                document_filename: filename_from_locator(&source_locator),
                chunk_index,
                text,
                created_at,
                updated_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_result(score: f64) -> SearchResultItem {
        SearchResultItem {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            score,
            ..Default::default()
        }
    }

    #[test]
    fn rrf_prefers_items_ranked_high_in_both_lists() {
        let dense = vec![("a".to_string(), 0.9), ("b".to_string(), 0.8)];
        let sparse = vec![("b".to_string(), 5.0), ("a".to_string(), 4.0)];
        let fused = reciprocal_rank_fusion(&dense, &sparse, 60.0, 0.6, 0.4);
        assert_eq!(fused.len(), 2);
        assert!(fused[0].1 > 0.0);
    }

    #[test]
    fn optimizer_skips_on_large_gap() {
        let config = test_config();
        assert!(should_skip_reranking(&[0.9, 0.1, 0.05], &config));
    }

    #[test]
    fn optimizer_does_not_skip_tight_cluster() {
        let config = test_config();
        assert!(!should_skip_reranking(&[0.40, 0.39, 0.38, 0.37], &config));
    }

    #[test]
    fn confidence_level_high_on_wide_gap() {
        let config = test_config();
        assert_eq!(reranking_confidence_level(&[0.95, 0.1], &config), "high");
    }

    #[test]
    fn confidence_level_low_on_tight_cluster() {
        let config = test_config();
        assert_eq!(reranking_confidence_level(&[0.40, 0.39, 0.38, 0.37], &config), "low");
    }

    #[test]
    fn expand_query_default_includes_original() {
        let variants = expand_query("What is the capital of France", "balanced");
        assert!(variants.contains(&"What is the capital of France".to_string()));
    }

    #[test]
    fn crag_evaluates_correct_when_top_clears_floor() {
        let results = vec![test_result(0.9), test_result(0.8), test_result(0.85)];
        let eval = evaluate_crag(&results, 0.5);
        assert_eq!(eval.quality_level, "correct");
        assert!(!eval.should_apply_correction);
    }

    #[test]
    fn crag_evaluates_incorrect_on_empty_results() {
        let eval = evaluate_crag(&[], 0.5);
        assert_eq!(eval.quality_level, "incorrect");
        assert_eq!(eval.corrective_action, "requery");
    }

    #[test]
    fn crag_correction_drop_tail_is_idempotent() {
        let results = vec![test_result(0.9), test_result(0.2), test_result(0.8)];
        let eval = CragEvaluation {
            quality_level: "ambiguous".to_string(),
            confidence_score: 0.5,
            corrective_action: "drop_low_confidence_tail".to_string(),
            reasoning: "test".to_string(),
            should_apply_correction: true,
        };
        let (first, metrics1) = apply_crag_correction(results.clone(), &eval, 0.5);
        assert_eq!(metrics1.original_count, 3);
        assert_eq!(first.len(), 2);

        let (second, metrics2) = apply_crag_correction(first.clone(), &eval, 0.5);
        assert_eq!(second.len(), first.len());
        assert_eq!(metrics2.original_count, metrics2.corrected_count);
    }

    #[test]
    fn crag_correction_requery_passes_through_unchanged() {
        let results = vec![test_result(0.1)];
        let eval = CragEvaluation {
            quality_level: "incorrect".to_string(),
            confidence_score: 0.0,
            corrective_action: "requery".to_string(),
            reasoning: "test".to_string(),
            should_apply_correction: true,
        };
        let (corrected, metrics) = apply_crag_correction(results, &eval, 0.5);
        assert_eq!(corrected.len(), 1);
        assert_eq!(metrics.original_count, metrics.corrected_count);
    }

    #[test]
    fn recency_boost_favors_newer_document_at_equal_similarity() {
        let candidates = vec![
            Candidate {
                chunk_id: "old".to_string(),
                document_id: "d1".to_string(),
                title: None,
                document_filename: "old.pdf".to_string(),
                chunk_index: 0,
                text: String::new(),
                created_at: 1000,
                updated_at: 1000,
            },
            Candidate {
                chunk_id: "new".to_string(),
                document_id: "d2".to_string(),
                title: None,
                document_filename: "new.pdf".to_string(),
                chunk_index: 0,
                text: String::new(),
                created_at: 2000,
                updated_at: 2000,
            },
        ];
        let boosted = apply_recency_boost(&candidates, &[0.5, 0.5], 0.5);
        assert!(boosted[1] > boosted[0]);
    }

    #[test]
    fn filename_from_locator_extracts_basename() {
        assert_eq!(filename_from_locator("/data/files/report.pdf"), "report.pdf");
        assert_eq!(filename_from_locator("https://example.com/docs/page"), "page");
    }

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [db]
            path = "test.db"
            [chunking]
            chunk_size = 1000
            chunk_overlap = 200
            [retrieval]
            final_limit = 10
            [server]
            bind = "127.0.0.1:8080"
            "#,
        )
        .unwrap()
    }
}
