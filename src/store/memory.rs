//! In-memory [`FactStore`] implementation for tests.
//!
//! Uses `HashMap` behind `std::sync::RwLock` for thread safety. Keyword
//! search is term-count scoring over fact content; vector search is
//! brute-force cosine similarity over stored vectors.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CandidateFilter, Fact, FactCandidate, VerificationConfig, VerificationState};
use crate::provider::cosine_similarity;

use super::FactStore;

const SNIPPET_CHARS: usize = 240;

/// In-memory store for tests and ephemeral deployments.
pub struct MemoryStore {
    facts: RwLock<HashMap<String, Fact>>,
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    config: RwLock<Option<VerificationConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            facts: RwLock::new(HashMap::new()),
            vectors: RwLock::new(HashMap::new()),
            config: RwLock::new(None),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn snippet_of(content: &str) -> String {
    content.chars().take(SNIPPET_CHARS).collect()
}

#[async_trait]
impl FactStore for MemoryStore {
    async fn put_fact(&self, fact: &Fact) -> Result<()> {
        let mut facts = self.facts.write().unwrap();
        facts.insert(fact.id.clone(), fact.clone());
        Ok(())
    }

    async fn get_fact(&self, id: &str) -> Result<Option<Fact>> {
        let facts = self.facts.read().unwrap();
        Ok(facts.get(id).cloned())
    }

    async fn set_state(
        &self,
        id: &str,
        expected: VerificationState,
        new: VerificationState,
        reviewer: &str,
    ) -> Result<bool> {
        let mut facts = self.facts.write().unwrap();
        match facts.get_mut(id) {
            Some(f) if f.state == expected => {
                f.state = new;
                f.reviewed_by = Some(reviewer.to_string());
                f.updated_at = chrono::Utc::now().timestamp();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_fact(&self, id: &str) -> Result<bool> {
        let removed = self.facts.write().unwrap().remove(id).is_some();
        self.vectors.write().unwrap().remove(id);
        Ok(removed)
    }

    async fn find_by_dedup_hash(&self, hash: &str) -> Result<Option<Fact>> {
        if hash.is_empty() {
            return Ok(None);
        }
        let facts = self.facts.read().unwrap();
        Ok(facts.values().find(|f| f.dedup_hash == hash).cloned())
    }

    async fn upsert_vector(&self, fact_id: &str, vector: &[f32], _model: &str) -> Result<()> {
        let mut vectors = self.vectors.write().unwrap();
        vectors.insert(fact_id.to_string(), vector.to_vec());
        Ok(())
    }

    async fn keyword_search(
        &self,
        text: &str,
        filter: &CandidateFilter,
        limit: i64,
    ) -> Result<Vec<FactCandidate>> {
        let query_lower = text.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let facts = self.facts.read().unwrap();
        let mut candidates: Vec<FactCandidate> = facts
            .values()
            .filter(|f| filter.admits(f))
            .filter_map(|f| {
                let content_lower = f.content.to_lowercase();
                let matches: usize = terms.iter().filter(|t| content_lower.contains(*t)).count();
                if matches > 0 {
                    Some(FactCandidate {
                        fact_id: f.id.clone(),
                        raw_score: matches as f64,
                        snippet: snippet_of(&f.content),
                    })
                } else {
                    None
                }
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.fact_id.cmp(&b.fact_id))
        });
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &CandidateFilter,
        limit: i64,
    ) -> Result<Vec<FactCandidate>> {
        let facts = self.facts.read().unwrap();
        let vectors = self.vectors.read().unwrap();
        let mut candidates: Vec<FactCandidate> = vectors
            .iter()
            .filter_map(|(fact_id, vec)| {
                let fact = facts.get(fact_id)?;
                if !filter.admits(fact) {
                    return None;
                }
                let score = cosine_similarity(query_vec, vec) as f64;
                if score <= 0.0 {
                    return None;
                }
                Some(FactCandidate {
                    fact_id: fact_id.clone(),
                    raw_score: score,
                    snippet: snippet_of(&fact.content),
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.fact_id.cmp(&b.fact_id))
        });
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn list_pending(&self, offset: i64, limit: i64) -> Result<(Vec<Fact>, i64)> {
        let facts = self.facts.read().unwrap();
        let mut pending: Vec<Fact> = facts
            .values()
            .filter(|f| f.state == VerificationState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let total = pending.len() as i64;
        let page: Vec<Fact> = pending
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn session_facts(&self, session_id: &str) -> Result<Vec<Fact>> {
        let facts = self.facts.read().unwrap();
        let mut session: Vec<Fact> = facts
            .values()
            .filter(|f| f.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        session.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(session)
    }

    async fn set_preserve(&self, session_id: &str, fact_id: &str, preserve: bool) -> Result<bool> {
        let mut facts = self.facts.write().unwrap();
        match facts.get_mut(fact_id) {
            Some(f) if f.session_id.as_deref() == Some(session_id) => {
                f.preserve = preserve;
                f.updated_at = chrono::Utc::now().timestamp();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn detach_session(&self, fact_id: &str) -> Result<bool> {
        let mut facts = self.facts.write().unwrap();
        match facts.get_mut(fact_id) {
            Some(f) if f.session_id.is_some() => {
                f.session_id = None;
                f.preserve = false;
                f.updated_at = chrono::Utc::now().timestamp();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_verification_config(&self) -> Result<Option<VerificationConfig>> {
        Ok(self.config.read().unwrap().clone())
    }

    async fn save_verification_config(&self, cfg: &VerificationConfig) -> Result<()> {
        *self.config.write().unwrap() = Some(cfg.clone());
        Ok(())
    }
}
