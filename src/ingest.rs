//! Fact ingestion: text, URL fetch, and local files into the store.
//!
//! Every ingested fact gets a content hash for deduplication, lands in the
//! verification queue unless its source is auto-approved, and is embedded
//! inline when a provider is configured. Embedding failure never fails the
//! ingest; the fact simply has no vector until re-embedded.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::{AccessLevel, AuthScope, Fact, VerificationConfig, VerificationState};
use crate::provider::ModelProvider;
use crate::store::FactStore;
use crate::verify;

/// Where the content of a new fact comes from.
#[derive(Debug, Clone)]
pub enum FactSource {
    /// Inline text.
    Text(String),
    /// Fetched over HTTP; the response body is ingested as-is.
    Url(String),
    /// Read from the local filesystem. Only offered by the CLI; the HTTP
    /// surface never reads server-local paths.
    File(PathBuf),
}

impl FactSource {
    fn label(&self) -> &'static str {
        match self {
            FactSource::Text(_) => "manual",
            FactSource::Url(_) => "url",
            FactSource::File(_) => "file",
        }
    }
}

/// Caller-supplied metadata for a new fact.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewFactMeta {
    #[serde(default)]
    pub title: Option<String>,
    /// Overrides the provenance label derived from the source kind.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub access_level: Option<AccessLevel>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub shared_with: Vec<String>,
    /// Attaches the fact to a session ledger.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Result of an ingest attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Created {
        fact_id: String,
        state: VerificationState,
        embedded: bool,
    },
    /// Identical content already exists; nothing was written.
    Duplicate { existing_id: String },
}

/// Ingest tuning, derived from provider settings.
#[derive(Debug, Clone)]
pub struct IngestParams {
    pub embed_timeout: Duration,
    pub fetch_timeout: Duration,
    pub embedding_model: String,
}

impl IngestParams {
    pub fn from_config(provider: &ProviderConfig) -> Self {
        Self {
            embed_timeout: Duration::from_secs(provider.embed_timeout_secs),
            fetch_timeout: Duration::from_secs(provider.fetch_timeout_secs),
            embedding_model: provider
                .embedding_model
                .clone()
                .unwrap_or_else(|| "none".to_string()),
        }
    }
}

impl Default for IngestParams {
    fn default() -> Self {
        Self::from_config(&ProviderConfig::default())
    }
}

/// Ingest one fact from any source.
pub async fn ingest(
    store: &dyn FactStore,
    provider: &dyn ModelProvider,
    scope: &AuthScope,
    source: FactSource,
    meta: NewFactMeta,
    vcfg: &VerificationConfig,
    params: &IngestParams,
) -> Result<IngestOutcome> {
    let content = resolve_content(&source, params).await?;
    let content = content.trim().to_string();
    if content.is_empty() {
        return Err(Error::invalid("fact content must not be empty"));
    }

    let dedup_hash = content_hash(&content);
    if let Some(existing) = store.find_by_dedup_hash(&dedup_hash).await? {
        info!(existing_id = %existing.id, "duplicate content, skipping ingest");
        return Ok(IngestOutcome::Duplicate {
            existing_id: existing.id,
        });
    }

    let source_label = meta
        .source
        .unwrap_or_else(|| source.label().to_string());
    let state = if verify::auto_approves(vcfg, &source_label) {
        VerificationState::Approved
    } else {
        VerificationState::Pending
    };

    let now = chrono::Utc::now().timestamp();
    let fact = Fact {
        id: Uuid::new_v4().to_string(),
        content,
        title: meta.title,
        source: source_label,
        category: meta.category.unwrap_or_else(|| "general".to_string()),
        tags: meta.tags,
        access_level: meta.access_level.unwrap_or(AccessLevel::Private),
        owner_id: scope.principal.clone(),
        organization_id: meta.organization_id.or_else(|| scope.organization.clone()),
        group_ids: meta.group_ids,
        shared_with: meta.shared_with,
        created_at: now,
        updated_at: now,
        state,
        reviewed_by: None,
        session_id: meta.session_id,
        preserve: false,
        dedup_hash,
    };
    store.put_fact(&fact).await?;

    let embedded = embed_inline(store, provider, &fact, params).await;
    info!(
        fact_id = %fact.id,
        source = %fact.source,
        state = %fact.state.as_str(),
        embedded,
        "fact ingested"
    );

    Ok(IngestOutcome::Created {
        fact_id: fact.id,
        state: fact.state,
        embedded,
    })
}

/// Re-embed an existing fact, for backfill after a provider change.
pub async fn reembed(
    store: &dyn FactStore,
    provider: &dyn ModelProvider,
    fact_id: &str,
    params: &IngestParams,
) -> Result<bool> {
    let fact = store
        .get_fact(fact_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("fact {} not found", fact_id)))?;
    Ok(embed_inline(store, provider, &fact, params).await)
}

async fn resolve_content(source: &FactSource, params: &IngestParams) -> Result<String> {
    match source {
        FactSource::Text(text) => Ok(text.clone()),
        FactSource::Url(url) => fetch_url(url, params.fetch_timeout).await,
        FactSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::invalid(format!("cannot read {}: {}", path.display(), e))
        }),
    }
}

async fn fetch_url(url: &str, timeout: Duration) -> Result<String> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(Error::invalid(format!("unsupported URL scheme: {}", url)));
    }
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("http client: {}", e)))?;
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::upstream(format!("fetch {}: {}", url, e)))?;
    if !resp.status().is_success() {
        return Err(Error::upstream(format!(
            "fetch {}: status {}",
            url,
            resp.status()
        )));
    }
    resp.text()
        .await
        .map_err(|e| Error::upstream(format!("read body of {}: {}", url, e)))
}

/// Best-effort embedding. Returns whether a vector was stored.
async fn embed_inline(
    store: &dyn FactStore,
    provider: &dyn ModelProvider,
    fact: &Fact,
    params: &IngestParams,
) -> bool {
    if !provider.is_enabled() {
        return false;
    }
    let embedding =
        match tokio::time::timeout(params.embed_timeout, provider.embed(&fact.content)).await {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => {
                warn!(fact_id = %fact.id, error = %e, "embedding failed, fact stored without vector");
                return false;
            }
            Err(_) => {
                warn!(fact_id = %fact.id, "embedding timed out, fact stored without vector");
                return false;
            }
        };
    match store
        .upsert_vector(&fact.id, &embedding, &params.embedding_model)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!(fact_id = %fact.id, error = %e, "storing embedding failed");
            false
        }
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DisabledProvider;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_text_ingest_lands_pending() {
        let store = MemoryStore::new();
        let outcome = ingest(
            &store,
            &DisabledProvider,
            &AuthScope::default(),
            FactSource::Text("the build runs nightly at 02:00".into()),
            NewFactMeta::default(),
            &VerificationConfig::default(),
            &IngestParams::default(),
        )
        .await
        .unwrap();

        let IngestOutcome::Created { fact_id, state, embedded } = outcome else {
            panic!("expected created");
        };
        assert_eq!(state, VerificationState::Pending);
        assert!(!embedded);

        let fact = store.get_fact(&fact_id).await.unwrap().unwrap();
        assert_eq!(fact.source, "manual");
        assert_eq!(fact.owner_id, "anonymous");
        assert!(!fact.dedup_hash.is_empty());
    }

    #[tokio::test]
    async fn test_auto_approved_source() {
        let store = MemoryStore::new();
        let vcfg = VerificationConfig {
            auto_approve_sources: vec!["manual".into()],
            ..VerificationConfig::default()
        };
        let outcome = ingest(
            &store,
            &DisabledProvider,
            &AuthScope::default(),
            FactSource::Text("trusted note".into()),
            NewFactMeta::default(),
            &vcfg,
            &IngestParams::default(),
        )
        .await
        .unwrap();
        let IngestOutcome::Created { state, .. } = outcome else {
            panic!("expected created");
        };
        assert_eq!(state, VerificationState::Approved);
    }

    #[tokio::test]
    async fn test_duplicate_content_is_skipped() {
        let store = MemoryStore::new();
        let scope = AuthScope::default();
        let first = ingest(
            &store,
            &DisabledProvider,
            &scope,
            FactSource::Text("same words".into()),
            NewFactMeta::default(),
            &VerificationConfig::default(),
            &IngestParams::default(),
        )
        .await
        .unwrap();
        let IngestOutcome::Created { fact_id, .. } = first else {
            panic!("expected created");
        };

        let second = ingest(
            &store,
            &DisabledProvider,
            &scope,
            FactSource::Text("  same words  ".into()),
            NewFactMeta::default(),
            &VerificationConfig::default(),
            &IngestParams::default(),
        )
        .await
        .unwrap();
        let IngestOutcome::Duplicate { existing_id } = second else {
            panic!("expected duplicate");
        };
        assert_eq!(existing_id, fact_id);
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let store = MemoryStore::new();
        let err = ingest(
            &store,
            &DisabledProvider,
            &AuthScope::default(),
            FactSource::Text("   \n ".into()),
            NewFactMeta::default(),
            &VerificationConfig::default(),
            &IngestParams::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_file_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "release is tagged from main").unwrap();

        let store = MemoryStore::new();
        let outcome = ingest(
            &store,
            &DisabledProvider,
            &AuthScope::default(),
            FactSource::File(path),
            NewFactMeta::default(),
            &VerificationConfig::default(),
            &IngestParams::default(),
        )
        .await
        .unwrap();
        let IngestOutcome::Created { fact_id, .. } = outcome else {
            panic!("expected created");
        };
        let fact = store.get_fact(&fact_id).await.unwrap().unwrap();
        assert_eq!(fact.source, "file");
        assert_eq!(fact.content, "release is tagged from main");
    }
}
