//! Core data models for facts, queries, and lifecycle outcomes.
//!
//! These types flow through the retrieval engine, the verification workflow,
//! and the session fact ledger. Filter inputs are fixed, explicitly typed
//! structs validated at the boundary — there is no open-ended filter map.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Who may see a fact, before per-principal sharing is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Private,
    Shared,
    Public,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Private => "private",
            AccessLevel::Shared => "shared",
            AccessLevel::Public => "public",
        }
    }
}

impl FromStr for AccessLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(AccessLevel::Private),
            "shared" => Ok(AccessLevel::Shared),
            "public" => Ok(AccessLevel::Public),
            other => Err(Error::invalid(format!("unknown access level: {}", other))),
        }
    }
}

/// Provenance gate state. `Approved` and `Rejected` are terminal:
/// re-ingestion creates a new fact rather than resurrecting an old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Pending,
    Approved,
    Rejected,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Pending => "pending",
            VerificationState::Approved => "approved",
            VerificationState::Rejected => "rejected",
        }
    }
}

impl FromStr for VerificationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(VerificationState::Pending),
            "approved" => Ok(VerificationState::Approved),
            "rejected" => Ok(VerificationState::Rejected),
            other => Err(Error::Internal(format!(
                "unknown verification state in store: {}",
                other
            ))),
        }
    }
}

/// A unit of stored knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub content: String,
    pub title: Option<String>,
    /// Free-text provenance label (e.g. `"manual"`, `"url:docs"`, `"chat"`).
    pub source: String,
    pub category: String,
    pub tags: Vec<String>,
    pub access_level: AccessLevel,
    pub owner_id: String,
    pub organization_id: Option<String>,
    pub group_ids: Vec<String>,
    pub shared_with: Vec<String>,
    /// Unix seconds.
    pub created_at: i64,
    pub updated_at: i64,
    pub state: VerificationState,
    /// Principal that approved or rejected the fact; `None` while pending.
    pub reviewed_by: Option<String>,
    /// Present when the fact originated from a chat session.
    pub session_id: Option<String>,
    /// Only meaningful when `session_id` is set.
    pub preserve: bool,
    pub dedup_hash: String,
}

impl Fact {
    /// Whether the fact's access attributes permit this principal.
    ///
    /// Public facts are visible to everyone. Shared facts are visible to the
    /// owner, the owner's organization, explicitly shared principals, and
    /// overlapping groups. Private facts are visible only to the owner and
    /// explicitly shared principals. Admin scopes see everything.
    pub fn visible_to(&self, scope: &AuthScope) -> bool {
        if scope.admin {
            return true;
        }
        if self.owner_id == scope.principal {
            return true;
        }
        if self.shared_with.iter().any(|p| *p == scope.principal) {
            return true;
        }
        match self.access_level {
            AccessLevel::Public => true,
            AccessLevel::Private => false,
            AccessLevel::Shared => {
                let same_org = match (&self.organization_id, &scope.organization) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                };
                same_org || self.group_ids.iter().any(|g| scope.groups.contains(g))
            }
        }
    }
}

/// Authorization context supplied by the caller on every request.
///
/// The core treats this as opaque input to the visibility filter; it never
/// fetches memberships itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthScope {
    pub principal: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub admin: bool,
}

impl Default for AuthScope {
    fn default() -> Self {
        Self {
            principal: "anonymous".to_string(),
            organization: None,
            groups: Vec::new(),
            admin: false,
        }
    }
}

impl AuthScope {
    /// Scope used by operator tooling (CLI); sees every fact.
    pub fn system() -> Self {
        Self {
            principal: "system".to_string(),
            organization: None,
            groups: Vec::new(),
            admin: true,
        }
    }
}

/// A typed search request. Filter dimensions are conjunctive across
/// dimensions and disjunctive within a dimension.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Pending facts are retrievable only under this explicit flag.
    #[serde(default)]
    pub include_pending: bool,
    #[serde(default)]
    pub enable_reranking: bool,
    /// Populate [`ScoreExplanation`] on each result.
    #[serde(default)]
    pub explain: bool,
}

/// Visibility and filter constraints applied by the store when collecting
/// search candidates. Evaluated against current store state on every query.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    pub scope: AuthScope,
    pub include_pending: bool,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
}

impl CandidateFilter {
    pub fn admits(&self, fact: &Fact) -> bool {
        let state_ok = match fact.state {
            VerificationState::Approved => true,
            VerificationState::Pending => self.include_pending,
            VerificationState::Rejected => false,
        };
        if !state_ok || !fact.visible_to(&self.scope) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&fact.category) {
            return false;
        }
        if !self.tags.is_empty() && !fact.tags.iter().any(|t| self.tags.contains(t)) {
            return false;
        }
        true
    }
}

/// A candidate fact returned from one retrieval channel, before merging.
#[derive(Debug, Clone)]
pub struct FactCandidate {
    pub fact_id: String,
    /// Raw channel score (BM25 rank negated, or cosine similarity).
    pub raw_score: f64,
    pub snippet: String,
}

/// Scoring breakdown for a search result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreExplanation {
    /// Normalized keyword score (0.0 if absent from the keyword channel).
    pub keyword_score: f64,
    /// Normalized vector score (0.0 if absent from the vector channel).
    pub vector_score: f64,
    /// Blend weight: `hybrid = (1-α)·keyword + α·vector`.
    pub alpha: f64,
    /// True when the fact matched only one channel and the solo discount applied.
    pub solo_discount_applied: bool,
    /// True when the secondary reranking pass rescored this result.
    pub reranked: bool,
}

/// A ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub id: String,
    pub title: Option<String>,
    pub source: String,
    pub category: String,
    /// Relevance score; higher is more relevant.
    pub score: f64,
    pub snippet: String,
    pub updated_at: i64,
    pub state: VerificationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ScoreExplanation>,
}

/// Search results plus a degradation marker.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    /// True when the vector channel was unavailable and results are
    /// lexical/filter-only.
    pub degraded: bool,
}

/// A retrieval-augmented generation request.
#[derive(Debug, Clone, Deserialize)]
pub struct RagQuery {
    #[serde(flatten)]
    pub query: SearchQuery,
    /// Ask the synthesis collaborator to reformulate the query first.
    #[serde(default)]
    pub reformulate: bool,
}

/// A synthesized answer grounded in retrieved facts.
#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    /// Everything retrieved as grounding.
    pub sources: Vec<SearchResultItem>,
    /// Fact ids the synthesis collaborator actually used.
    pub sources_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reformulated_query: Option<String>,
    pub confidence: f64,
    /// Set when no usable sources were available; the answer is never fabricated.
    pub low_confidence: bool,
}

/// Auto-approval policy and review defaults. An explicit value passed into
/// and returned from the verification workflow — no process-wide singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Facts from these provenance labels skip review and ingest as approved.
    #[serde(default)]
    pub auto_approve_sources: Vec<String>,
    /// Default for hard-deleting a fact on rejection.
    #[serde(default)]
    pub delete_on_reject: bool,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page_size() -> i64 {
    20
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            auto_approve_sources: Vec::new(),
            delete_on_reject: false,
            page_size: default_page_size(),
        }
    }
}

/// Summary row in the pending review queue.
#[derive(Debug, Clone, Serialize)]
pub struct PendingFact {
    pub id: String,
    pub title: Option<String>,
    pub source: String,
    pub category: String,
    pub created_at: i64,
}

impl From<&Fact> for PendingFact {
    fn from(f: &Fact) -> Self {
        Self {
            id: f.id.clone(),
            title: f.title.clone(),
            source: f.source.clone(),
            category: f.category.clone(),
            created_at: f.created_at,
        }
    }
}

/// Outcome of an approve/reject action. A no-op is reported explicitly,
/// carrying who won the race, so concurrent reviewers can detect double
/// submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Applied {
        state: VerificationState,
    },
    NoOp {
        current_state: VerificationState,
        reviewed_by: Option<String>,
    },
}

/// Per-item failure detail for bulk operations.
#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub id: String,
    pub message: String,
}

/// Aggregate result of a bulk mutation. `status` is `"success"` only when
/// no item failed; otherwise `"partial"` with per-id detail.
#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub status: String,
    pub updated: u64,
    pub failed: u64,
    pub errors: Vec<ItemError>,
}

impl BulkOutcome {
    pub fn new(updated: u64, errors: Vec<ItemError>) -> Self {
        let failed = errors.len() as u64;
        Self {
            status: if failed == 0 { "success" } else { "partial" }.to_string(),
            updated,
            failed,
            errors,
        }
    }
}

/// Denormalized view of a session-derived fact.
#[derive(Debug, Clone, Serialize)]
pub struct SessionFactRecord {
    pub fact_id: String,
    /// Truncated preview of the content.
    pub content: String,
    pub full_content: String,
    pub category: String,
    pub tags: Vec<String>,
    /// System-assigned salience.
    pub important: bool,
    /// User-assigned preservation flag.
    pub preserve: bool,
    pub created_at: i64,
}

const PREVIEW_CHARS: usize = 160;

impl From<&Fact> for SessionFactRecord {
    fn from(f: &Fact) -> Self {
        Self {
            fact_id: f.id.clone(),
            content: f.content.chars().take(PREVIEW_CHARS).collect(),
            full_content: f.content.clone(),
            category: f.category.clone(),
            tags: f.tags.clone(),
            important: f.tags.iter().any(|t| t == "important"),
            preserve: f.preserve,
            created_at: f.created_at,
        }
    }
}

/// What happens to non-preserved session *attachments* on session deletion.
/// Facts always follow the `preserve` flag regardless of this action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Delete,
    TransferKb,
    TransferShared,
}

impl FromStr for FileAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "delete" => Ok(FileAction::Delete),
            "transfer_kb" => Ok(FileAction::TransferKb),
            "transfer_shared" => Ok(FileAction::TransferShared),
            other => Err(Error::invalid(format!(
                "unknown file action: {}. Use delete, transfer_kb, or transfer_shared.",
                other
            ))),
        }
    }
}

/// Result of end-of-session cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResolution {
    pub deleted: u64,
    pub preserved: u64,
    pub failed: u64,
    pub errors: Vec<ItemError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(access: AccessLevel) -> Fact {
        Fact {
            id: "f1".into(),
            content: "the quarterly report is due friday".into(),
            title: None,
            source: "manual".into(),
            category: "general".into(),
            tags: vec!["finance".into()],
            access_level: access,
            owner_id: "alice".into(),
            organization_id: Some("acme".into()),
            group_ids: vec!["finance-team".into()],
            shared_with: vec!["bob".into()],
            created_at: 100,
            updated_at: 100,
            state: VerificationState::Approved,
            reviewed_by: None,
            session_id: None,
            preserve: false,
            dedup_hash: String::new(),
        }
    }

    fn scope(principal: &str) -> AuthScope {
        AuthScope {
            principal: principal.into(),
            organization: None,
            groups: Vec::new(),
            admin: false,
        }
    }

    #[test]
    fn test_private_fact_visible_to_owner_and_shared_only() {
        let f = fact(AccessLevel::Private);
        assert!(f.visible_to(&scope("alice")));
        assert!(f.visible_to(&scope("bob")));
        assert!(!f.visible_to(&scope("mallory")));
    }

    #[test]
    fn test_shared_fact_visible_within_org_and_groups() {
        let f = fact(AccessLevel::Shared);
        let mut same_org = scope("carol");
        same_org.organization = Some("acme".into());
        assert!(f.visible_to(&same_org));

        let mut other_org = scope("carol");
        other_org.organization = Some("globex".into());
        assert!(!f.visible_to(&other_org));

        let mut grouped = scope("dave");
        grouped.groups = vec!["finance-team".into()];
        assert!(f.visible_to(&grouped));
    }

    #[test]
    fn test_public_fact_visible_to_anyone() {
        let f = fact(AccessLevel::Public);
        assert!(f.visible_to(&scope("mallory")));
    }

    #[test]
    fn test_admin_scope_sees_everything() {
        let f = fact(AccessLevel::Private);
        assert!(f.visible_to(&AuthScope::system()));
    }

    #[test]
    fn test_filter_excludes_rejected_always() {
        let mut f = fact(AccessLevel::Public);
        f.state = VerificationState::Rejected;
        let filter = CandidateFilter {
            scope: AuthScope::system(),
            include_pending: true,
            categories: Vec::new(),
            tags: Vec::new(),
        };
        assert!(!filter.admits(&f));
    }

    #[test]
    fn test_filter_pending_requires_flag() {
        let mut f = fact(AccessLevel::Public);
        f.state = VerificationState::Pending;
        let mut filter = CandidateFilter {
            scope: AuthScope::system(),
            include_pending: false,
            categories: Vec::new(),
            tags: Vec::new(),
        };
        assert!(!filter.admits(&f));
        filter.include_pending = true;
        assert!(filter.admits(&f));
    }

    #[test]
    fn test_filter_dimensions_conjunctive_membership_disjunctive() {
        let f = fact(AccessLevel::Public);
        let filter = CandidateFilter {
            scope: scope("mallory"),
            include_pending: false,
            categories: vec!["general".into(), "other".into()],
            tags: vec!["finance".into(), "legal".into()],
        };
        assert!(filter.admits(&f));

        let mismatched = CandidateFilter {
            categories: vec!["other".into()],
            ..filter
        };
        assert!(!mismatched.admits(&f));
    }
}
