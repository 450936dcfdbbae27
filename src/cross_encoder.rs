//! Cross-encoder reranking provider abstraction.
//!
//! Mirrors [`crate::embedding::EmbeddingProvider`]: a trait that exposes only
//! provider identity, with the actual scoring done by a free function that
//! dispatches on `CrossEncoderConfig.provider` (kept free for the same
//! async-trait-object reasons the embedding module documents). A disabled
//! provider errors on use so the reranking stage fails loudly instead of
//! silently no-op'ing when a caller forgets to gate on
//! `config.cross_encoder.is_enabled()` first.

use anyhow::{bail, Result};

use crate::bm25::tokenize;
use crate::config::CrossEncoderConfig;

/// Trait for cross-encoder reranking providers.
///
/// The actual (query, candidate) scoring is performed by [`score_pairs`]
/// (kept as a free function due to async trait limitations); this trait
/// exists to expose provider metadata and to give the pipeline a typed
/// handle distinct from "no provider configured at all".
pub trait CrossEncoderProvider: Send + Sync {
    fn provider_name(&self) -> &str;
}

/// Used when `cross_encoder.provider = "disabled"`. Any call to
/// [`score_pairs`] against it errors — the reranking stage is meant to be
/// skipped entirely when disabled, not silently scored as zero.
pub struct DisabledCrossEncoderProvider;

impl CrossEncoderProvider for DisabledCrossEncoderProvider {
    fn provider_name(&self) -> &str {
        "disabled"
    }
}

/// Lexical-overlap stand-in for a real cross-encoder model call. Scores a
/// (query, candidate) pair by Jaccard overlap of their token sets. Selected
/// via `cross_encoder.provider = "proxy"`.
pub struct JaccardProxyProvider;

impl CrossEncoderProvider for JaccardProxyProvider {
    fn provider_name(&self) -> &str {
        "proxy"
    }
}

/// Instantiate the provider named by `config.provider`.
pub fn create_cross_encoder_provider(config: &CrossEncoderConfig) -> Result<Box<dyn CrossEncoderProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledCrossEncoderProvider)),
        "proxy" => Ok(Box::new(JaccardProxyProvider)),
        other => bail!("Unknown cross-encoder provider: {}", other),
    }
}

/// Score `query` against each of `candidates`, in order. Dispatches on
/// `config.provider`; the `"disabled"` provider always errors, so callers
/// must check `config.is_enabled()` before entering the reranking stage at
/// all rather than relying on this to no-op.
///
/// * `_provider` — provider instance (used for metadata; dispatch is config-based).
pub async fn score_pairs(
    _provider: &dyn CrossEncoderProvider,
    config: &CrossEncoderConfig,
    query: &str,
    candidates: &[String],
) -> Result<Vec<f64>> {
    match config.provider.as_str() {
        "proxy" => Ok(jaccard_scores(query, candidates)),
        "disabled" => bail!("cross-encoder provider is disabled"),
        other => bail!("Unknown cross-encoder provider: {}", other),
    }
}

fn jaccard_scores(query: &str, candidates: &[String]) -> Vec<f64> {
    let query_terms: std::collections::HashSet<String> = tokenize(query).into_iter().collect();
    candidates
        .iter()
        .map(|text| {
            let doc_terms: std::collections::HashSet<String> = tokenize(text).into_iter().collect();
            let overlap = query_terms.intersection(&doc_terms).count() as f64;
            let union = query_terms.union(&doc_terms).count().max(1) as f64;
            overlap / union
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy_config() -> CrossEncoderConfig {
        CrossEncoderConfig {
            provider: "proxy".to_string(),
            model: None,
            min_score: 0.0,
        }
    }

    #[tokio::test]
    async fn proxy_scores_full_overlap_higher_than_unrelated() {
        let config = proxy_config();
        let provider = create_cross_encoder_provider(&config).unwrap();
        let scores = score_pairs(
            provider.as_ref(),
            &config,
            "rust programming guide",
            &[
                "rust programming guide".to_string(),
                "totally unrelated text about gardening".to_string(),
            ],
        )
        .await
        .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn disabled_provider_errors_on_score() {
        let config = CrossEncoderConfig::default();
        let provider = create_cross_encoder_provider(&config).unwrap();
        let result = score_pairs(provider.as_ref(), &config, "q", &["a".to_string()]).await;
        assert!(result.is_err());
    }

    #[test]
    fn unknown_provider_fails_to_construct() {
        let config = CrossEncoderConfig {
            provider: "bogus".to_string(),
            model: None,
            min_score: 0.0,
        };
        assert!(create_cross_encoder_provider(&config).is_err());
    }
}
