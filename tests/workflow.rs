//! End-to-end lifecycle tests over the in-memory store: ingest through
//! review into retrieval, visibility enforcement, degraded search, and
//! session cleanup.

use std::sync::Arc;

use async_trait::async_trait;
use factgate::error::{Error, Result};
use factgate::ingest::{self, FactSource, IngestOutcome, IngestParams, NewFactMeta};
use factgate::models::{
    AccessLevel, AuthScope, FileAction, RagQuery, ReviewOutcome, SearchQuery, SearchResultItem,
    VerificationConfig, VerificationState,
};
use factgate::provider::{DisabledProvider, ModelProvider, Synthesis};
use factgate::search::{self, SearchParams};
use factgate::session;
use factgate::store::memory::MemoryStore;
use factgate::store::FactStore;
use factgate::verify;

/// Deterministic provider: embeds into a tiny bag-of-letters vector and
/// synthesizes a canned answer citing every source.
struct StubProvider {
    cite_sources: bool,
}

#[async_trait]
impl ModelProvider for StubProvider {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; 26];
        for b in text.bytes() {
            if b.is_ascii_alphabetic() {
                v[(b.to_ascii_lowercase() - b'a') as usize] += 1.0;
            }
        }
        Ok(v)
    }

    async fn reformulate_query(&self, text: &str) -> Result<String> {
        Ok(format!("{} (expanded)", text))
    }

    async fn synthesize(&self, _query: &str, sources: &[SearchResultItem]) -> Result<Synthesis> {
        let sources_used = if self.cite_sources {
            sources.iter().map(|s| s.id.clone()).collect()
        } else {
            Vec::new()
        };
        Ok(Synthesis {
            answer: "stubbed answer".to_string(),
            sources_used,
            confidence: 0.9,
        })
    }
}

/// Provider that claims to be enabled but cannot embed.
struct BrokenEmbedProvider;

#[async_trait]
impl ModelProvider for BrokenEmbedProvider {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::upstream("embedding endpoint down"))
    }

    async fn reformulate_query(&self, _text: &str) -> Result<String> {
        Err(Error::upstream("embedding endpoint down"))
    }

    async fn synthesize(&self, _query: &str, _sources: &[SearchResultItem]) -> Result<Synthesis> {
        Err(Error::upstream("embedding endpoint down"))
    }
}

fn query(text: &str) -> SearchQuery {
    SearchQuery {
        text: text.to_string(),
        limit: None,
        categories: Vec::new(),
        tags: Vec::new(),
        include_pending: false,
        enable_reranking: false,
        explain: false,
    }
}

async fn ingest_text(
    store: &dyn FactStore,
    provider: &dyn ModelProvider,
    scope: &AuthScope,
    text: &str,
    meta: NewFactMeta,
    vcfg: &VerificationConfig,
) -> String {
    let outcome = ingest::ingest(
        store,
        provider,
        scope,
        FactSource::Text(text.to_string()),
        meta,
        vcfg,
        &IngestParams::default(),
    )
    .await
    .unwrap();
    match outcome {
        IngestOutcome::Created { fact_id, .. } => fact_id,
        IngestOutcome::Duplicate { .. } => panic!("unexpected duplicate"),
    }
}

#[tokio::test]
async fn ingest_review_retrieve_lifecycle() {
    let store = MemoryStore::new();
    let scope = AuthScope::system();
    let vcfg = VerificationConfig::default();
    let params = SearchParams::default();

    let fact_id = ingest_text(
        &store,
        &DisabledProvider,
        &scope,
        "the deploy pipeline promotes staging to production on fridays",
        NewFactMeta::default(),
        &vcfg,
    )
    .await;

    // Pending facts are invisible to default retrieval.
    let resp = search::search(&store, &DisabledProvider, &scope, &query("deploy"), &params)
        .await
        .unwrap();
    assert!(resp.results.is_empty());

    // But visible to an explicit review-time query.
    let mut preview = query("deploy");
    preview.include_pending = true;
    let resp = search::search(&store, &DisabledProvider, &scope, &preview, &params)
        .await
        .unwrap();
    assert_eq!(resp.results.len(), 1);

    // It shows up in the review queue; approving makes it retrievable.
    let page = verify::list_pending(&store, 1, None, &vcfg).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.facts[0].id, fact_id);

    let outcome = verify::approve(&store, &fact_id, "reviewer").await.unwrap();
    assert_eq!(
        outcome,
        ReviewOutcome::Applied {
            state: VerificationState::Approved
        }
    );

    let resp = search::search(&store, &DisabledProvider, &scope, &query("deploy"), &params)
        .await
        .unwrap();
    assert_eq!(resp.results.len(), 1);
    assert_eq!(resp.results[0].id, fact_id);

    // A repeated approval is reported as a no-op naming the original
    // reviewer, not an error.
    let outcome = verify::approve(&store, &fact_id, "second-reviewer")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReviewOutcome::NoOp {
            current_state: VerificationState::Approved,
            reviewed_by: Some("reviewer".into()),
        }
    );

    // The queue is empty again.
    let page = verify::list_pending(&store, 1, None, &vcfg).await.unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn rejected_facts_never_surface() {
    let store = MemoryStore::new();
    let scope = AuthScope::system();
    let vcfg = VerificationConfig::default();
    let params = SearchParams::default();

    let fact_id = ingest_text(
        &store,
        &DisabledProvider,
        &scope,
        "the moon is made of cheese",
        NewFactMeta::default(),
        &vcfg,
    )
    .await;
    verify::reject(&store, &fact_id, "reviewer", None, &vcfg)
        .await
        .unwrap();

    // Not even include_pending surfaces a rejected fact.
    let mut q = query("moon cheese");
    q.include_pending = true;
    let resp = search::search(&store, &DisabledProvider, &scope, &q, &params)
        .await
        .unwrap();
    assert!(resp.results.is_empty());

    // Retained for audit, though.
    let fact = store.get_fact(&fact_id).await.unwrap().unwrap();
    assert_eq!(fact.state, VerificationState::Rejected);
}

#[tokio::test]
async fn visibility_is_enforced_per_caller() {
    let store = MemoryStore::new();
    let vcfg = VerificationConfig {
        auto_approve_sources: vec!["manual".into()],
        ..VerificationConfig::default()
    };
    let params = SearchParams::default();

    let alice = AuthScope {
        principal: "alice".into(),
        organization: Some("acme".into()),
        groups: Vec::new(),
        admin: false,
    };
    let bob = AuthScope {
        principal: "bob".into(),
        organization: Some("acme".into()),
        groups: Vec::new(),
        admin: false,
    };
    let outsider = AuthScope {
        principal: "mallory".into(),
        organization: Some("globex".into()),
        groups: Vec::new(),
        admin: false,
    };

    ingest_text(
        &store,
        &DisabledProvider,
        &alice,
        "alice private planning notes",
        NewFactMeta {
            access_level: Some(AccessLevel::Private),
            ..NewFactMeta::default()
        },
        &vcfg,
    )
    .await;
    ingest_text(
        &store,
        &DisabledProvider,
        &alice,
        "acme planning calendar for the quarter",
        NewFactMeta {
            access_level: Some(AccessLevel::Shared),
            ..NewFactMeta::default()
        },
        &vcfg,
    )
    .await;

    let count = |scope: AuthScope| {
        let store = &store;
        let params = &params;
        async move {
            search::search(store, &DisabledProvider, &scope, &query("planning"), params)
                .await
                .unwrap()
                .results
                .len()
        }
    };

    assert_eq!(count(alice).await, 2);
    // Same org sees shared but not private.
    assert_eq!(count(bob).await, 1);
    // Different org sees neither.
    assert_eq!(count(outsider).await, 0);
}

#[tokio::test]
async fn auto_approved_source_skips_queue() {
    let store = MemoryStore::new();
    let scope = AuthScope::system();
    let vcfg = VerificationConfig {
        auto_approve_sources: vec!["manual".into()],
        ..VerificationConfig::default()
    };

    ingest_text(
        &store,
        &DisabledProvider,
        &scope,
        "trusted operational note",
        NewFactMeta::default(),
        &vcfg,
    )
    .await;

    let page = verify::list_pending(&store, 1, None, &vcfg).await.unwrap();
    assert_eq!(page.total, 0);

    let resp = search::search(
        &store,
        &DisabledProvider,
        &scope,
        &query("operational"),
        &SearchParams::default(),
    )
    .await
    .unwrap();
    assert_eq!(resp.results.len(), 1);
}

#[tokio::test]
async fn broken_vector_channel_degrades_instead_of_failing() {
    let store = MemoryStore::new();
    let scope = AuthScope::system();
    let vcfg = VerificationConfig {
        auto_approve_sources: vec!["manual".into()],
        ..VerificationConfig::default()
    };

    ingest_text(
        &store,
        &DisabledProvider,
        &scope,
        "failover runbook for the primary database",
        NewFactMeta::default(),
        &vcfg,
    )
    .await;

    let resp = search::search(
        &store,
        &BrokenEmbedProvider,
        &scope,
        &query("failover runbook"),
        &SearchParams::default(),
    )
    .await
    .unwrap();
    assert!(resp.degraded);
    assert_eq!(resp.results.len(), 1);
}

#[tokio::test]
async fn hybrid_merge_uses_both_channels() {
    let store = MemoryStore::new();
    let scope = AuthScope::system();
    let vcfg = VerificationConfig {
        auto_approve_sources: vec!["manual".into()],
        ..VerificationConfig::default()
    };
    let provider = StubProvider { cite_sources: true };

    let fact_id = ingest_text(
        &store,
        &provider,
        &scope,
        "incident escalation contacts",
        NewFactMeta::default(),
        &vcfg,
    )
    .await;

    let mut q = query("incident escalation");
    q.explain = true;
    let resp = search::search(&store, &provider, &scope, &q, &SearchParams::default())
        .await
        .unwrap();
    assert!(!resp.degraded);
    assert_eq!(resp.results[0].id, fact_id);
    let explain = resp.results[0].explain.as_ref().unwrap();
    // Matched in both channels, so no solo discount.
    assert!(!explain.solo_discount_applied);
    assert!(explain.keyword_score > 0.0);
    assert!(explain.vector_score > 0.0);
}

#[tokio::test]
async fn rag_answers_and_flags_low_confidence() {
    let store = MemoryStore::new();
    let scope = AuthScope::system();
    let vcfg = VerificationConfig {
        auto_approve_sources: vec!["manual".into()],
        ..VerificationConfig::default()
    };
    let params = SearchParams::default();

    ingest_text(
        &store,
        &StubProvider { cite_sources: true },
        &scope,
        "the backup window starts at midnight utc",
        NewFactMeta::default(),
        &vcfg,
    )
    .await;

    // Grounded answer with cited sources.
    let rag = RagQuery {
        query: query("backup window"),
        reformulate: true,
    };
    let provider = StubProvider { cite_sources: true };
    let answer = search::rag_search(&store, &provider, &scope, &rag, &params)
        .await
        .unwrap();
    assert_eq!(answer.answer, "stubbed answer");
    assert!(!answer.low_confidence);
    assert!(!answer.sources_used.is_empty());
    assert_eq!(
        answer.reformulated_query.as_deref(),
        Some("backup window (expanded)")
    );

    // Synthesis that cites nothing is flagged.
    let provider = StubProvider {
        cite_sources: false,
    };
    let rag = RagQuery {
        query: query("backup window"),
        reformulate: false,
    };
    let answer = search::rag_search(&store, &provider, &scope, &rag, &params)
        .await
        .unwrap();
    assert!(answer.low_confidence);

    // No retrievable material at all: empty answer, never fabricated.
    let provider = StubProvider { cite_sources: true };
    let rag = RagQuery {
        query: query("zzzz qqqq xxxx"),
        reformulate: false,
    };
    let answer = search::rag_search(&store, &provider, &scope, &rag, &params)
        .await
        .unwrap();
    assert!(answer.low_confidence);
    assert!(answer.answer.is_empty());
    assert!(answer.sources.is_empty());
}

#[tokio::test]
async fn bulk_review_reports_partial_failure() {
    let store: Arc<dyn FactStore> = Arc::new(MemoryStore::new());
    let scope = AuthScope::system();
    let vcfg = VerificationConfig::default();

    let a = ingest_text(
        store.as_ref(),
        &DisabledProvider,
        &scope,
        "fact alpha",
        NewFactMeta::default(),
        &vcfg,
    )
    .await;
    let b = ingest_text(
        store.as_ref(),
        &DisabledProvider,
        &scope,
        "fact beta",
        NewFactMeta::default(),
        &vcfg,
    )
    .await;
    // One of them is already reviewed.
    verify::approve(store.as_ref(), &a, "alice").await.unwrap();

    let outcome = verify::bulk_approve(
        Arc::clone(&store),
        vec![a.clone(), b.clone(), "missing-id".into()],
        "bob",
    )
    .await
    .unwrap();
    assert_eq!(outcome.updated, 1);
    assert_eq!(outcome.failed, 2);
    assert_eq!(outcome.status, "partial");

    let mut failed_ids: Vec<&str> = outcome.errors.iter().map(|e| e.id.as_str()).collect();
    failed_ids.sort_unstable();
    assert_eq!(failed_ids, vec![a.as_str(), "missing-id"]);

    // The double-submission error names the reviewer who got there first.
    let dup = outcome.errors.iter().find(|e| e.id == a).unwrap();
    assert_eq!(dup.message, "already approved by alice");
}

#[tokio::test]
async fn session_resolution_deletes_unpreserved_facts() {
    let store: Arc<dyn FactStore> = Arc::new(MemoryStore::new());
    let scope = AuthScope::system();
    let vcfg = VerificationConfig {
        auto_approve_sources: vec!["manual".into()],
        ..VerificationConfig::default()
    };

    let meta = |session: &str| NewFactMeta {
        session_id: Some(session.to_string()),
        ..NewFactMeta::default()
    };
    let f1 = ingest_text(
        store.as_ref(),
        &DisabledProvider,
        &scope,
        "user prefers dark mode",
        meta("s1"),
        &vcfg,
    )
    .await;
    let f2 = ingest_text(
        store.as_ref(),
        &DisabledProvider,
        &scope,
        "user timezone is utc+2",
        meta("s1"),
        &vcfg,
    )
    .await;
    let f3 = ingest_text(
        store.as_ref(),
        &DisabledProvider,
        &scope,
        "scratch note about a typo",
        meta("s1"),
        &vcfg,
    )
    .await;

    session::set_preserve(store.as_ref(), "s1", &f2, true)
        .await
        .unwrap();

    let records = session::list_session_facts(store.as_ref(), "s1")
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records.iter().filter(|r| r.preserve).count(), 1);

    let resolution = session::resolve_session(Arc::clone(&store), "s1", FileAction::Delete)
        .await
        .unwrap();
    assert_eq!(resolution.deleted, 2);
    assert_eq!(resolution.preserved, 1);
    assert_eq!(resolution.failed, 0);

    assert!(store.get_fact(&f1).await.unwrap().is_none());
    assert!(store.get_fact(&f3).await.unwrap().is_none());
    let kept = store.get_fact(&f2).await.unwrap().unwrap();
    assert!(kept.session_id.is_none());

    // The preserved fact is now a plain knowledge-base entry and still
    // retrievable.
    let resp = search::search(
        store.as_ref(),
        &DisabledProvider,
        &scope,
        &query("timezone"),
        &SearchParams::default(),
    )
    .await
    .unwrap();
    assert_eq!(resp.results.len(), 1);
    assert_eq!(resp.results[0].id, f2);
}

#[tokio::test]
async fn duplicate_ingest_is_reported_not_stored() {
    let store = MemoryStore::new();
    let scope = AuthScope::system();
    let vcfg = VerificationConfig::default();

    let first = ingest::ingest(
        &store,
        &DisabledProvider,
        &scope,
        FactSource::Text("retention policy is ninety days".into()),
        NewFactMeta::default(),
        &vcfg,
        &IngestParams::default(),
    )
    .await
    .unwrap();
    let IngestOutcome::Created { fact_id, .. } = first else {
        panic!("expected created");
    };

    let second = ingest::ingest(
        &store,
        &DisabledProvider,
        &scope,
        FactSource::Text("retention policy is ninety days".into()),
        NewFactMeta::default(),
        &vcfg,
        &IngestParams::default(),
    )
    .await
    .unwrap();
    assert!(matches!(
        second,
        IngestOutcome::Duplicate { existing_id } if existing_id == fact_id
    ));
}
