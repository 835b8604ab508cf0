//! Session fact ledger: lifecycle of facts extracted during a work session.
//!
//! Session-derived facts stay associated with their session until the
//! session is resolved. At resolution, each fact follows its own `preserve`
//! flag: preserved facts are detached into the permanent knowledge base,
//! the rest are deleted with their index entries. The flag is read from the
//! store at resolution time, so a toggle that lands before cleanup always
//! wins.
//!
//! Bulk mutations here use the same bounded fan-out as the review queue and
//! never abort the batch on a single bad id.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::{BulkOutcome, FileAction, ItemError, SessionFactRecord, SessionResolution};
use crate::store::FactStore;

const BULK_CONCURRENCY: usize = 8;

/// List the facts attached to a session, newest first.
pub async fn list_session_facts(
    store: &dyn FactStore,
    session_id: &str,
) -> Result<Vec<SessionFactRecord>> {
    if session_id.trim().is_empty() {
        return Err(Error::invalid("session id must not be empty"));
    }
    let facts = store.session_facts(session_id).await?;
    Ok(facts.iter().map(SessionFactRecord::from).collect())
}

/// Flag one session fact for preservation (or clear the flag).
pub async fn set_preserve(
    store: &dyn FactStore,
    session_id: &str,
    fact_id: &str,
    preserve: bool,
) -> Result<()> {
    if store.set_preserve(session_id, fact_id, preserve).await? {
        Ok(())
    } else {
        Err(Error::NotFound(format!(
            "fact {} is not part of session {}",
            fact_id, session_id
        )))
    }
}

/// Set the preserve flag on many session facts at once.
pub async fn bulk_preserve(
    store: Arc<dyn FactStore>,
    session_id: &str,
    fact_ids: Vec<String>,
    preserve: bool,
) -> Result<BulkOutcome> {
    if fact_ids.is_empty() {
        return Err(Error::invalid("no fact ids given"));
    }

    let semaphore = Arc::new(Semaphore::new(BULK_CONCURRENCY));
    let mut set = JoinSet::new();
    for fact_id in fact_ids {
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        let session_id = session_id.to_string();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(|_| {
                Error::Internal("bulk worker semaphore closed".to_string())
            })?;
            let res = set_preserve(store.as_ref(), &session_id, &fact_id, preserve).await;
            Ok::<_, Error>((fact_id, res))
        });
    }

    let mut updated = 0u64;
    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (fact_id, res) = joined
            .map_err(|e| Error::Internal(format!("bulk worker panicked: {}", e)))??;
        match res {
            Ok(()) => updated += 1,
            Err(e) => errors.push(ItemError {
                id: fact_id,
                message: e.to_string(),
            }),
        }
    }

    Ok(BulkOutcome::new(updated, errors))
}

/// Resolve a session: delete its non-preserved facts, detach the preserved
/// ones into the permanent knowledge base.
///
/// `file_action` records what the caller chose for session attachments; it
/// does not change fact handling, which always follows the `preserve` flag.
/// The per-fact flags are re-read here, not taken from any earlier listing.
pub async fn resolve_session(
    store: Arc<dyn FactStore>,
    session_id: &str,
    file_action: FileAction,
) -> Result<SessionResolution> {
    if session_id.trim().is_empty() {
        return Err(Error::invalid("session id must not be empty"));
    }

    let facts = store.session_facts(session_id).await?;
    info!(
        session_id = %session_id,
        facts = facts.len(),
        file_action = ?file_action,
        "resolving session"
    );

    let semaphore = Arc::new(Semaphore::new(BULK_CONCURRENCY));
    let mut set = JoinSet::new();
    for fact in facts {
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(|_| {
                Error::Internal("bulk worker semaphore closed".to_string())
            })?;
            let preserved = fact.preserve;
            let res = if preserved {
                store.detach_session(&fact.id).await.map(|_| ())
            } else {
                store.delete_fact(&fact.id).await.map(|_| ())
            };
            Ok::<_, Error>((fact.id, preserved, res))
        });
    }

    let mut deleted = 0u64;
    let mut preserved = 0u64;
    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (id, was_preserved, res) = joined
            .map_err(|e| Error::Internal(format!("bulk worker panicked: {}", e)))??;
        match res {
            Ok(()) if was_preserved => preserved += 1,
            Ok(()) => deleted += 1,
            Err(e) => errors.push(ItemError {
                id,
                message: e.to_string(),
            }),
        }
    }

    let resolution = SessionResolution {
        deleted,
        preserved,
        failed: errors.len() as u64,
        errors,
    };
    info!(
        session_id = %session_id,
        deleted = resolution.deleted,
        preserved = resolution.preserved,
        failed = resolution.failed,
        "session resolved"
    );
    Ok(resolution)
}

/// Delete a batch of facts regardless of session association.
pub async fn bulk_delete(store: Arc<dyn FactStore>, fact_ids: Vec<String>) -> Result<BulkOutcome> {
    if fact_ids.is_empty() {
        return Err(Error::invalid("no fact ids given"));
    }

    let semaphore = Arc::new(Semaphore::new(BULK_CONCURRENCY));
    let mut set = JoinSet::new();
    for fact_id in fact_ids {
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(|_| {
                Error::Internal("bulk worker semaphore closed".to_string())
            })?;
            let res = store.delete_fact(&fact_id).await;
            Ok::<_, Error>((fact_id, res))
        });
    }

    let mut updated = 0u64;
    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (fact_id, res) = joined
            .map_err(|e| Error::Internal(format!("bulk worker panicked: {}", e)))??;
        match res {
            Ok(true) => updated += 1,
            Ok(false) => errors.push(ItemError {
                id: fact_id,
                message: "not found".to_string(),
            }),
            Err(e) => errors.push(ItemError {
                id: fact_id,
                message: e.to_string(),
            }),
        }
    }

    Ok(BulkOutcome::new(updated, errors))
}
