//! Storage abstraction for the knowledge core.
//!
//! The [`FactStore`] trait defines every operation the retrieval engine,
//! verification workflow, and session fact ledger need from the underlying
//! durable store, enabling pluggable backends (SQLite, in-memory).
//!
//! The store is the single source of truth for `state` and `preserve`;
//! callers never cache those fields across requests. State transitions go
//! through [`FactStore::set_state`], a conditional write that linearizes
//! concurrent reviews (first writer wins).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CandidateFilter, Fact, FactCandidate, VerificationConfig, VerificationState};

#[async_trait]
pub trait FactStore: Send + Sync {
    /// Insert or fully update a fact.
    async fn put_fact(&self, fact: &Fact) -> Result<()>;

    /// Fetch a fact by id.
    async fn get_fact(&self, id: &str) -> Result<Option<Fact>>;

    /// Compare-and-swap the verification state, recording the reviewer.
    ///
    /// Returns `true` if the fact existed in `expected` state and was moved
    /// to `new`, with `reviewer` stored as `reviewed_by`; `false` if the
    /// write lost (wrong current state or missing fact). Bumps `updated_at`
    /// on success.
    async fn set_state(
        &self,
        id: &str,
        expected: VerificationState,
        new: VerificationState,
        reviewer: &str,
    ) -> Result<bool>;

    /// Hard-delete a fact and its index entries. Returns `false` if absent.
    async fn delete_fact(&self, id: &str) -> Result<bool>;

    /// Look up a fact by content hash, for ingest-time deduplication.
    async fn find_by_dedup_hash(&self, hash: &str) -> Result<Option<Fact>>;

    /// Store or replace the embedding vector for a fact.
    async fn upsert_vector(&self, fact_id: &str, vector: &[f32], model: &str) -> Result<()>;

    /// Lexical/filter candidate channel. Results are already visibility
    /// filtered via [`CandidateFilter::admits`].
    async fn keyword_search(
        &self,
        text: &str,
        filter: &CandidateFilter,
        limit: i64,
    ) -> Result<Vec<FactCandidate>>;

    /// Vector-similarity candidate channel over stored embeddings.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &CandidateFilter,
        limit: i64,
    ) -> Result<Vec<FactCandidate>>;

    /// Pending facts ordered by `created_at` ascending, id ascending, with
    /// the total pending count. Stable under concurrent approvals.
    async fn list_pending(&self, offset: i64, limit: i64) -> Result<(Vec<Fact>, i64)>;

    /// All facts tagged with a session, most recently created first.
    async fn session_facts(&self, session_id: &str) -> Result<Vec<Fact>>;

    /// Set the preserve flag on one session fact. Returns `false` if the
    /// fact is not part of the session (or no longer exists).
    async fn set_preserve(&self, session_id: &str, fact_id: &str, preserve: bool) -> Result<bool>;

    /// Clear the session association, turning the fact into a standalone
    /// knowledge-base entry. Returns `false` if the fact has no session.
    async fn detach_session(&self, fact_id: &str) -> Result<bool>;

    /// Persisted verification config, if one has been saved.
    async fn load_verification_config(&self) -> Result<Option<VerificationConfig>>;

    async fn save_verification_config(&self, cfg: &VerificationConfig) -> Result<()>;
}
