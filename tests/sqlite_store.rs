//! Integration tests for the SQLite backend: schema, FTS5 search, CAS
//! state transitions, vector storage, and settings persistence.

use std::sync::Arc;

use factgate::config::DbConfig;
use factgate::migrate;
use factgate::models::{
    AccessLevel, AuthScope, CandidateFilter, Fact, VerificationConfig, VerificationState,
};
use factgate::store::sqlite::SqliteStore;
use factgate::store::FactStore;
use factgate::verify;

async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
    let db = DbConfig {
        path: dir.path().join("factgate.sqlite"),
    };
    let store = SqliteStore::connect(&db).await.unwrap();
    // Running migrations twice must be safe.
    migrate::run_migrations(store.pool()).await.unwrap();
    migrate::run_migrations(store.pool()).await.unwrap();
    store
}

fn make_fact(id: &str, content: &str) -> Fact {
    Fact {
        id: id.to_string(),
        content: content.to_string(),
        title: Some("note".to_string()),
        source: "manual".into(),
        category: "ops".into(),
        tags: vec!["runbook".into()],
        access_level: AccessLevel::Public,
        owner_id: "alice".into(),
        organization_id: Some("acme".into()),
        group_ids: vec!["platform".into()],
        shared_with: vec!["bob".into()],
        created_at: 1_700_000_000,
        updated_at: 1_700_000_000,
        state: VerificationState::Approved,
        reviewed_by: None,
        session_id: None,
        preserve: false,
        dedup_hash: format!("hash-{}", id),
    }
}

fn admit_all() -> CandidateFilter {
    CandidateFilter {
        scope: AuthScope::system(),
        include_pending: true,
        categories: Vec::new(),
        tags: Vec::new(),
    }
}

#[tokio::test]
async fn roundtrip_and_fts_search() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let fact = make_fact("f1", "restart the ingest worker after a schema change");
    store.put_fact(&fact).await.unwrap();

    let loaded = store.get_fact("f1").await.unwrap().unwrap();
    assert_eq!(loaded.content, fact.content);
    assert_eq!(loaded.tags, vec!["runbook".to_string()]);
    assert_eq!(loaded.group_ids, vec!["platform".to_string()]);
    assert_eq!(loaded.shared_with, vec!["bob".to_string()]);
    assert_eq!(loaded.access_level, AccessLevel::Public);
    assert_eq!(loaded.state, VerificationState::Approved);

    let hits = store
        .keyword_search("ingest worker", &admit_all(), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].fact_id, "f1");
    assert!(hits[0].snippet.contains(">>>"));

    // Category filter excludes it.
    let mut filter = admit_all();
    filter.categories = vec!["finance".into()];
    let hits = store
        .keyword_search("ingest worker", &filter, 10)
        .await
        .unwrap();
    assert!(hits.is_empty());

    // Quotes in the query must not break the FTS parser.
    let hits = store
        .keyword_search(r#"the "ingest" worker"#, &admit_all(), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn updating_a_fact_refreshes_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let mut fact = make_fact("f1", "original wording about databases");
    store.put_fact(&fact).await.unwrap();

    fact.content = "revised wording about caching".to_string();
    store.put_fact(&fact).await.unwrap();

    let old = store
        .keyword_search("databases", &admit_all(), 10)
        .await
        .unwrap();
    assert!(old.is_empty());
    let new = store
        .keyword_search("caching", &admit_all(), 10)
        .await
        .unwrap();
    assert_eq!(new.len(), 1);
}

#[tokio::test]
async fn conditional_state_update_is_first_writer_wins() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let mut fact = make_fact("f1", "awaiting review");
    fact.state = VerificationState::Pending;
    store.put_fact(&fact).await.unwrap();

    let won = store
        .set_state(
            "f1",
            VerificationState::Pending,
            VerificationState::Approved,
            "alice",
        )
        .await
        .unwrap();
    assert!(won);

    // Second transition from pending loses and must not overwrite the
    // recorded reviewer.
    let won = store
        .set_state(
            "f1",
            VerificationState::Pending,
            VerificationState::Rejected,
            "bob",
        )
        .await
        .unwrap();
    assert!(!won);
    let loaded = store.get_fact("f1").await.unwrap().unwrap();
    assert_eq!(loaded.state, VerificationState::Approved);
    assert_eq!(loaded.reviewed_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn put_fact_replaces_every_column() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let mut fact = make_fact("f1", "first draft");
    fact.state = VerificationState::Pending;
    store.put_fact(&fact).await.unwrap();

    fact.state = VerificationState::Approved;
    fact.reviewed_by = Some("carol".into());
    fact.owner_id = "bob".into();
    fact.created_at = 1_700_000_100;
    store.put_fact(&fact).await.unwrap();

    let loaded = store.get_fact("f1").await.unwrap().unwrap();
    assert_eq!(loaded.state, VerificationState::Approved);
    assert_eq!(loaded.reviewed_by.as_deref(), Some("carol"));
    assert_eq!(loaded.owner_id, "bob");
    assert_eq!(loaded.created_at, 1_700_000_100);
}

#[tokio::test]
async fn vectors_and_dedup() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    store.put_fact(&make_fact("f1", "alpha")).await.unwrap();
    store.put_fact(&make_fact("f2", "beta")).await.unwrap();
    store
        .upsert_vector("f1", &[1.0, 0.0, 0.0], "stub-model")
        .await
        .unwrap();
    store
        .upsert_vector("f2", &[0.0, 1.0, 0.0], "stub-model")
        .await
        .unwrap();

    let hits = store
        .vector_search(&[1.0, 0.1, 0.0], &admit_all(), 10)
        .await
        .unwrap();
    assert_eq!(hits[0].fact_id, "f1");
    assert!(hits[0].raw_score > 0.9);

    let found = store.find_by_dedup_hash("hash-f2").await.unwrap().unwrap();
    assert_eq!(found.id, "f2");
    assert!(store.find_by_dedup_hash("absent").await.unwrap().is_none());

    // Deleting a fact removes its vector and index entries.
    assert!(store.delete_fact("f1").await.unwrap());
    let hits = store
        .vector_search(&[1.0, 0.0, 0.0], &admit_all(), 10)
        .await
        .unwrap();
    assert!(hits.iter().all(|c| c.fact_id != "f1"));
    let hits = store.keyword_search("alpha", &admit_all(), 10).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn session_columns_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let mut fact = make_fact("f1", "noted during the chat");
    fact.session_id = Some("s1".into());
    store.put_fact(&fact).await.unwrap();

    let session = store.session_facts("s1").await.unwrap();
    assert_eq!(session.len(), 1);

    assert!(store.set_preserve("s1", "f1", true).await.unwrap());
    assert!(!store.set_preserve("other-session", "f1", true).await.unwrap());
    let loaded = store.get_fact("f1").await.unwrap().unwrap();
    assert!(loaded.preserve);

    assert!(store.detach_session("f1").await.unwrap());
    let loaded = store.get_fact("f1").await.unwrap().unwrap();
    assert!(loaded.session_id.is_none());
    assert!(!loaded.preserve);
    // Already detached.
    assert!(!store.detach_session("f1").await.unwrap());
}

#[tokio::test]
async fn verification_config_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(&dir).await;
        let cfg = VerificationConfig {
            auto_approve_sources: vec!["url".into()],
            delete_on_reject: true,
            page_size: 10,
        };
        verify::update_config(&store, &cfg).await.unwrap();
    }

    let store = open_store(&dir).await;
    let defaults = VerificationConfig::default();
    let loaded = verify::get_config(&store, &defaults).await.unwrap();
    assert_eq!(loaded.auto_approve_sources, vec!["url".to_string()]);
    assert!(loaded.delete_on_reject);
    assert_eq!(loaded.page_size, 10);
}

#[tokio::test]
async fn bulk_review_works_against_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn FactStore> = Arc::new(open_store(&dir).await);

    for i in 0..5 {
        let mut fact = make_fact(&format!("f{}", i), &format!("pending item {}", i));
        fact.state = VerificationState::Pending;
        fact.dedup_hash = format!("hash-{}", i);
        store.put_fact(&fact).await.unwrap();
    }

    let outcome = verify::bulk_approve(
        Arc::clone(&store),
        (0..5).map(|i| format!("f{}", i)).collect(),
        "reviewer",
    )
    .await
    .unwrap();
    assert_eq!(outcome.updated, 5);
    assert_eq!(outcome.status, "success");

    let (_, total) = store.list_pending(0, 10).await.unwrap();
    assert_eq!(total, 0);
}
