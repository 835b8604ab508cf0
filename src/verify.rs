//! Verification workflow: the pending review queue and state transitions.
//!
//! New facts land in `pending` unless their source is auto-approved. A
//! reviewer moves them to `approved` or `rejected` through a conditional
//! store write that also records who acted, so two reviewers racing on the
//! same fact cannot both win: the loser gets an explicit
//! [`ReviewOutcome::NoOp`] carrying the state the winner set and the
//! winner's name. Approve and reject are idempotent for this reason —
//! repeating an action reports a no-op rather than an error.
//!
//! Bulk actions fan out over a bounded worker set and report per-item
//! results; one bad id never aborts the rest of the batch.

use std::sync::Arc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::{
    BulkOutcome, ItemError, PendingFact, ReviewOutcome, VerificationConfig, VerificationState,
};
use crate::store::FactStore;

/// Concurrent store writes per bulk action.
const BULK_CONCURRENCY: usize = 8;

/// One page of the review queue, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct PendingPage {
    pub facts: Vec<PendingFact>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

/// List pending facts, paged. `page` is 1-based.
///
/// Ordering is `created_at` ascending with id as tie-break, so the queue
/// stays stable while reviewers work through it.
pub async fn list_pending(
    store: &dyn FactStore,
    page: i64,
    page_size: Option<i64>,
    cfg: &VerificationConfig,
) -> Result<PendingPage> {
    if page < 1 {
        return Err(Error::invalid("page must be >= 1"));
    }
    let page_size = page_size.unwrap_or(cfg.page_size).clamp(1, 200);
    let offset = (page - 1) * page_size;

    let (facts, total) = store.list_pending(offset, page_size).await?;
    let total_pages = if total == 0 {
        0
    } else {
        (total + page_size - 1) / page_size
    };

    Ok(PendingPage {
        facts: facts.iter().map(PendingFact::from).collect(),
        total,
        page,
        page_size,
        total_pages,
    })
}

/// Approve a pending fact, making it visible to default retrieval.
///
/// `reviewer` is recorded on the fact. Approval from any state other than
/// `pending` is a no-op reporting the original reviewer; an approved fact
/// never re-enters review.
pub async fn approve(store: &dyn FactStore, id: &str, reviewer: &str) -> Result<ReviewOutcome> {
    transition(store, id, VerificationState::Approved, reviewer, false).await
}

/// Reject a pending fact. With `delete` (defaulting to the configured
/// `delete_on_reject`), the fact and its index entries are removed
/// outright; otherwise it is retained in `rejected` state for audit.
pub async fn reject(
    store: &dyn FactStore,
    id: &str,
    reviewer: &str,
    delete: Option<bool>,
    cfg: &VerificationConfig,
) -> Result<ReviewOutcome> {
    let delete = delete.unwrap_or(cfg.delete_on_reject);
    transition(store, id, VerificationState::Rejected, reviewer, delete).await
}

async fn transition(
    store: &dyn FactStore,
    id: &str,
    target: VerificationState,
    reviewer: &str,
    delete_after: bool,
) -> Result<ReviewOutcome> {
    let won = store
        .set_state(id, VerificationState::Pending, target, reviewer)
        .await?;

    if !won {
        // Lost the conditional write: either the fact is gone or another
        // reviewer got there first. Report which, and by whom.
        return match store.get_fact(id).await? {
            Some(fact) => {
                warn!(
                    fact_id = %id,
                    current = %fact.state.as_str(),
                    reviewed_by = fact.reviewed_by.as_deref().unwrap_or("-"),
                    "review action was a no-op"
                );
                Ok(ReviewOutcome::NoOp {
                    current_state: fact.state,
                    reviewed_by: fact.reviewed_by,
                })
            }
            None => Err(Error::NotFound(format!("fact {} not found", id))),
        };
    }

    if delete_after {
        store.delete_fact(id).await?;
    }
    info!(
        fact_id = %id,
        state = %target.as_str(),
        reviewer = %reviewer,
        deleted = delete_after,
        "fact reviewed"
    );
    Ok(ReviewOutcome::Applied { state: target })
}

/// Approve a batch of pending facts concurrently.
pub async fn bulk_approve(
    store: Arc<dyn FactStore>,
    ids: Vec<String>,
    reviewer: &str,
) -> Result<BulkOutcome> {
    bulk_transition(store, ids, VerificationState::Approved, reviewer, false).await
}

/// Reject a batch of pending facts concurrently.
pub async fn bulk_reject(
    store: Arc<dyn FactStore>,
    ids: Vec<String>,
    reviewer: &str,
    delete: Option<bool>,
    cfg: &VerificationConfig,
) -> Result<BulkOutcome> {
    let delete = delete.unwrap_or(cfg.delete_on_reject);
    bulk_transition(store, ids, VerificationState::Rejected, reviewer, delete).await
}

async fn bulk_transition(
    store: Arc<dyn FactStore>,
    ids: Vec<String>,
    target: VerificationState,
    reviewer: &str,
    delete_after: bool,
) -> Result<BulkOutcome> {
    if ids.is_empty() {
        return Err(Error::invalid("no fact ids given"));
    }

    let semaphore = Arc::new(Semaphore::new(BULK_CONCURRENCY));
    let mut set = JoinSet::new();

    for id in ids {
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        let reviewer = reviewer.to_string();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(|_| {
                Error::Internal("bulk worker semaphore closed".to_string())
            })?;
            let outcome = transition(store.as_ref(), &id, target, &reviewer, delete_after).await;
            Ok::<_, Error>((id, outcome))
        });
    }

    let mut updated = 0u64;
    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (id, outcome) = joined
            .map_err(|e| Error::Internal(format!("bulk worker panicked: {}", e)))??;
        match outcome {
            Ok(ReviewOutcome::Applied { .. }) => updated += 1,
            Ok(ReviewOutcome::NoOp {
                current_state,
                reviewed_by,
            }) => errors.push(ItemError {
                id,
                message: match reviewed_by {
                    Some(who) => format!("already {} by {}", current_state.as_str(), who),
                    None => format!("already {}", current_state.as_str()),
                },
            }),
            Err(e) => errors.push(ItemError {
                id,
                message: e.to_string(),
            }),
        }
    }

    let outcome = BulkOutcome::new(updated, errors);
    info!(
        updated = outcome.updated,
        failed = outcome.failed,
        state = %target.as_str(),
        "bulk review finished"
    );
    Ok(outcome)
}

/// Effective verification config: the persisted one, or the configured
/// defaults when nothing has been saved yet.
pub async fn get_config(
    store: &dyn FactStore,
    defaults: &VerificationConfig,
) -> Result<VerificationConfig> {
    Ok(store
        .load_verification_config()
        .await?
        .unwrap_or_else(|| defaults.clone()))
}

/// Replace the persisted verification config.
pub async fn update_config(store: &dyn FactStore, cfg: &VerificationConfig) -> Result<()> {
    if cfg.page_size < 1 {
        return Err(Error::invalid("page_size must be >= 1"));
    }
    store.save_verification_config(cfg).await?;
    info!(
        auto_approve_sources = cfg.auto_approve_sources.len(),
        delete_on_reject = cfg.delete_on_reject,
        "verification config updated"
    );
    Ok(())
}

/// Whether a fact from `source` skips review entirely.
pub fn auto_approves(cfg: &VerificationConfig, source: &str) -> bool {
    cfg.auto_approve_sources.iter().any(|s| s == source)
}
