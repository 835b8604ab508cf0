//! Retrieval engine: hybrid search and retrieval-augmented answers.
//!
//! The engine operates entirely through the [`FactStore`] and
//! [`ModelProvider`] traits. Visibility is resolved against current store
//! state on every query; nothing authorization-relevant is cached.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch `candidate_k` keyword candidates and `candidate_k` vector
//!    candidates, both already visibility filtered.
//! 2. Min-max normalize each channel to `[0, 1]`.
//! 3. Merge by fact id. Present in both channels:
//!    `score = (1-α)·keyword + α·vector`. Present in exactly one channel:
//!    that channel's normalized score × the solo discount (0.8 default).
//! 4. If reranking is requested, rescore the top `rerank_cap` candidates
//!    with a term-overlap scorer, blended 50/50 into the hybrid score.
//! 5. Sort by score (desc), `updated_at` (desc), id (asc). Truncate.
//!
//! The discount and tie-break rule are fixed here so scoring is
//! reproducible and testable.
//!
//! If the vector channel fails (embedding timeout, provider outage), the
//! query degrades to lexical-only results with `degraded = true` instead of
//! failing outright. A disabled provider skips the channel without marking
//! degradation.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{ProviderConfig, RetrievalConfig};
use crate::error::{Error, Result};
use crate::models::{
    AuthScope, CandidateFilter, Fact, FactCandidate, RagAnswer, RagQuery, ScoreExplanation,
    SearchQuery, SearchResponse, SearchResultItem,
};
use crate::provider::ModelProvider;
use crate::store::FactStore;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Weight for vector vs keyword: `hybrid = (1-α)*keyword + α*vector`.
    pub hybrid_alpha: f64,
    /// Multiplier for facts found in only one channel.
    pub solo_discount: f64,
    /// Candidates fetched per channel.
    pub candidate_k: i64,
    /// Result limit when the query does not specify one.
    pub default_limit: i64,
    /// Hard cap on the per-query limit.
    pub max_limit: i64,
    /// Merged candidates passed to the reranking scorer.
    pub rerank_cap: usize,
    /// Store-read timeout (short tier).
    pub store_timeout: Duration,
    /// Embedding timeout (medium tier).
    pub embed_timeout: Duration,
    /// Synthesis timeout (long tier).
    pub synth_timeout: Duration,
}

impl SearchParams {
    pub fn from_config(retrieval: &RetrievalConfig, provider: &ProviderConfig) -> Self {
        Self {
            hybrid_alpha: retrieval.hybrid_alpha,
            solo_discount: retrieval.solo_discount,
            candidate_k: retrieval.candidate_k,
            default_limit: retrieval.default_limit,
            max_limit: retrieval.max_limit,
            rerank_cap: retrieval.rerank_cap,
            store_timeout: Duration::from_secs(retrieval.store_timeout_secs),
            embed_timeout: Duration::from_secs(provider.embed_timeout_secs),
            synth_timeout: Duration::from_secs(provider.synth_timeout_secs),
        }
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default(), &ProviderConfig::default())
    }
}

async fn with_timeout<T, F>(dur: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(dur, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::upstream(format!(
            "{} timed out after {}s",
            what,
            dur.as_secs()
        ))),
    }
}

struct Scored {
    fact: Fact,
    score: f64,
    keyword_score: f64,
    vector_score: f64,
    solo: bool,
    reranked: bool,
    snippet: String,
}

/// Run a hybrid search.
pub async fn search(
    store: &dyn FactStore,
    provider: &dyn ModelProvider,
    scope: &AuthScope,
    query: &SearchQuery,
    params: &SearchParams,
) -> Result<SearchResponse> {
    let text = query.text.trim();
    if text.is_empty() {
        return Err(Error::invalid("query text must not be empty"));
    }

    let limit = query
        .limit
        .unwrap_or(params.default_limit)
        .clamp(1, params.max_limit);

    let filter = CandidateFilter {
        scope: scope.clone(),
        include_pending: query.include_pending,
        categories: query.categories.clone(),
        tags: query.tags.clone(),
    };

    let keyword_candidates = with_timeout(
        params.store_timeout,
        "keyword search",
        store.keyword_search(text, &filter, params.candidate_k),
    )
    .await?;

    // Vector channel: degrade to lexical-only on failure rather than
    // failing the whole query. A disabled provider is not a degradation.
    let mut degraded = false;
    let vector_candidates = if provider.is_enabled() {
        let embedded =
            with_timeout(params.embed_timeout, "query embedding", provider.embed(text)).await;
        match embedded {
            Ok(query_vec) => {
                match with_timeout(
                    params.store_timeout,
                    "vector search",
                    store.vector_search(&query_vec, &filter, params.candidate_k),
                )
                .await
                {
                    Ok(cands) => cands,
                    Err(e) => {
                        warn!(error = %e, "vector channel unavailable, lexical-only results");
                        degraded = true;
                        Vec::new()
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "query embedding unavailable, lexical-only results");
                degraded = true;
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    if keyword_candidates.is_empty() && vector_candidates.is_empty() {
        return Ok(SearchResponse {
            results: Vec::new(),
            degraded,
        });
    }

    let norm_keyword = normalize_scores(&keyword_candidates);
    let norm_vector = normalize_scores(&vector_candidates);

    let kw_map: HashMap<&str, f64> = norm_keyword
        .iter()
        .map(|(c, s)| (c.fact_id.as_str(), *s))
        .collect();
    let vec_map: HashMap<&str, f64> = norm_vector
        .iter()
        .map(|(c, s)| (c.fact_id.as_str(), *s))
        .collect();

    // Keyword snippets carry FTS highlighting; prefer them on overlap.
    let mut snippets: HashMap<&str, &str> = HashMap::new();
    for c in &vector_candidates {
        snippets.insert(c.fact_id.as_str(), c.snippet.as_str());
    }
    for c in &keyword_candidates {
        snippets.insert(c.fact_id.as_str(), c.snippet.as_str());
    }

    let mut ids: Vec<&str> = kw_map.keys().copied().collect();
    for id in vec_map.keys() {
        if !kw_map.contains_key(id) {
            ids.push(id);
        }
    }

    let alpha = params.hybrid_alpha;
    let mut scored: Vec<Scored> = Vec::with_capacity(ids.len());

    for id in ids {
        let (score, k, v, solo) = match (kw_map.get(id), vec_map.get(id)) {
            (Some(&k), Some(&v)) => ((1.0 - alpha) * k + alpha * v, k, v, false),
            (Some(&k), None) => (k * params.solo_discount, k, 0.0, true),
            (None, Some(&v)) => (v * params.solo_discount, 0.0, v, true),
            (None, None) => continue,
        };

        // Visibility was checked at candidate collection; the fact may have
        // been deleted since, in which case it is silently dropped.
        let Some(fact) = store.get_fact(id).await? else {
            continue;
        };

        scored.push(Scored {
            score,
            keyword_score: k,
            vector_score: v,
            solo,
            reranked: false,
            snippet: snippets.get(id).unwrap_or(&"").to_string(),
            fact,
        });
    }

    if query.enable_reranking {
        rerank(text, &mut scored, params.rerank_cap);
    }

    scored.sort_by(rank_ordering);
    scored.truncate(limit as usize);

    debug!(
        results = scored.len(),
        degraded,
        reranked = query.enable_reranking,
        "search complete"
    );

    let results = scored
        .into_iter()
        .map(|s| {
            let explain = query.explain.then(|| ScoreExplanation {
                keyword_score: s.keyword_score,
                vector_score: s.vector_score,
                alpha,
                solo_discount_applied: s.solo,
                reranked: s.reranked,
            });
            SearchResultItem {
                id: s.fact.id,
                title: s.fact.title,
                source: s.fact.source,
                category: s.fact.category,
                score: s.score,
                snippet: s.snippet,
                updated_at: s.fact.updated_at,
                state: s.fact.state,
                explain,
            }
        })
        .collect();

    Ok(SearchResponse { results, degraded })
}

/// Ordering shared by the final result sort and the rerank pre-sort:
/// score descending, `updated_at` descending, id ascending.
fn rank_ordering(a: &Scored, b: &Scored) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(b.fact.updated_at.cmp(&a.fact.updated_at))
        .then(a.fact.id.cmp(&b.fact.id))
}

/// Secondary, more expensive relevance pass over a capped candidate set.
///
/// Rescores the top `cap` candidates as an even blend of the hybrid score
/// and a query-term overlap ratio against the full content. The pre-sort
/// uses the full tie-break chain so the set of rescored candidates is the
/// same on every run even when hybrid scores tie at the cap boundary.
fn rerank(query_text: &str, scored: &mut [Scored], cap: usize) {
    scored.sort_by(rank_ordering);
    let cap = cap.min(scored.len());
    for s in scored[..cap].iter_mut() {
        let overlap = term_overlap(query_text, &s.fact.content);
        s.score = 0.5 * s.score + 0.5 * overlap;
        s.reranked = true;
    }
}

/// Fraction of distinct query terms present in the content.
fn term_overlap(query_text: &str, content: &str) -> f64 {
    let query_lower = query_text.to_lowercase();
    let mut terms: Vec<&str> = query_lower.split_whitespace().collect();
    terms.sort_unstable();
    terms.dedup();
    if terms.is_empty() {
        return 0.0;
    }
    let content_lower = content.to_lowercase();
    let hits = terms
        .iter()
        .filter(|t| content_lower.contains(**t))
        .count();
    hits as f64 / terms.len() as f64
}

/// Run retrieval-augmented answer synthesis.
///
/// Optionally reformulates the query first (falling back to the original on
/// failure), retrieves grounding facts, then delegates to the synthesis
/// collaborator. If the collaborator reports zero usable sources, the
/// answer is flagged `low_confidence` rather than fabricated.
pub async fn rag_search(
    store: &dyn FactStore,
    provider: &dyn ModelProvider,
    scope: &AuthScope,
    rag: &RagQuery,
    params: &SearchParams,
) -> Result<RagAnswer> {
    if !provider.is_enabled() {
        return Err(Error::upstream(
            "answer synthesis requires a configured model provider",
        ));
    }
    if rag.query.text.trim().is_empty() {
        return Err(Error::invalid("query text must not be empty"));
    }

    let reformulated = if rag.reformulate {
        match with_timeout(
            params.synth_timeout,
            "query reformulation",
            provider.reformulate_query(&rag.query.text),
        )
        .await
        {
            Ok(rewritten) if !rewritten.trim().is_empty() => Some(rewritten),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "query reformulation unavailable, using original query");
                None
            }
        }
    } else {
        None
    };

    let mut effective = rag.query.clone();
    if let Some(ref rewritten) = reformulated {
        effective.text = rewritten.clone();
    }

    let retrieved = search(store, provider, scope, &effective, params).await?;

    if retrieved.results.is_empty() {
        return Ok(RagAnswer {
            answer: String::new(),
            sources: Vec::new(),
            sources_used: Vec::new(),
            reformulated_query: reformulated,
            confidence: 0.0,
            low_confidence: true,
        });
    }

    let synthesis = with_timeout(
        params.synth_timeout,
        "answer synthesis",
        provider.synthesize(&effective.text, &retrieved.results),
    )
    .await?;

    let low_confidence = synthesis.sources_used.is_empty();
    Ok(RagAnswer {
        answer: synthesis.answer,
        sources: retrieved.results,
        sources_used: synthesis.sources_used,
        reformulated_query: reformulated,
        confidence: synthesis.confidence,
        low_confidence,
    })
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[FactCandidate]) -> Vec<(&FactCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}
