use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::VerificationConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub verification: VerificationDefaults,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight for vector vs keyword: `hybrid = (1-α)*keyword + α*vector`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    /// Multiplier applied to a fact found in only one retrieval channel.
    #[serde(default = "default_solo_discount")]
    pub solo_discount: f64,
    /// Number of candidates fetched per channel before merging.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    /// Result limit when the query does not specify one.
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    /// Upper bound on the per-query result limit.
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
    /// Merged candidates passed to the secondary reranking scorer.
    #[serde(default = "default_rerank_cap")]
    pub rerank_cap: usize,
    /// Timeout for store reads during candidate collection.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_solo_discount() -> f64 {
    0.8
}
fn default_candidate_k() -> i64 {
    80
}
fn default_limit() -> i64 {
    20
}
fn default_max_limit() -> i64 {
    200
}
fn default_rerank_cap() -> usize {
    50
}
fn default_store_timeout() -> u64 {
    5
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            solo_discount: default_solo_discount(),
            candidate_k: default_candidate_k(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            rerank_cap: default_rerank_cap(),
            store_timeout_secs: default_store_timeout(),
        }
    }
}

/// Embedding and synthesis collaborator settings.
///
/// Timeouts follow the tiered classes of the surrounding system: short for
/// store reads (see [`RetrievalConfig`]), medium for embedding, long for
/// synthesis and URL ingestion.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// `"disabled"` or `"openai"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub synthesis_model: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout")]
    pub embed_timeout_secs: u64,
    #[serde(default = "default_synth_timeout")]
    pub synth_timeout_secs: u64,
    /// Timeout for URL fetches during ingestion.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_embed_timeout() -> u64 {
    30
}
fn default_synth_timeout() -> u64 {
    120
}
fn default_fetch_timeout() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            embedding_model: None,
            dims: None,
            synthesis_model: None,
            api_base: default_api_base(),
            max_retries: default_max_retries(),
            embed_timeout_secs: default_embed_timeout(),
            synth_timeout_secs: default_synth_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Seed values for the persisted [`VerificationConfig`], used until the
/// workflow stores its own copy.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct VerificationDefaults {
    #[serde(default)]
    pub auto_approve_sources: Vec<String>,
    #[serde(default)]
    pub delete_on_reject: bool,
    #[serde(default)]
    pub page_size: Option<i64>,
}

impl VerificationDefaults {
    pub fn to_verification_config(&self) -> VerificationConfig {
        let base = VerificationConfig::default();
        VerificationConfig {
            auto_approve_sources: self.auto_approve_sources.clone(),
            delete_on_reject: self.delete_on_reject,
            page_size: self.page_size.unwrap_or(base.page_size),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate retrieval
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.solo_discount) {
        anyhow::bail!("retrieval.solo_discount must be in [0.0, 1.0]");
    }
    if config.retrieval.default_limit < 1 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }
    if config.retrieval.max_limit < config.retrieval.default_limit {
        anyhow::bail!("retrieval.max_limit must be >= retrieval.default_limit");
    }
    if config.retrieval.candidate_k < 1 {
        anyhow::bail!("retrieval.candidate_k must be >= 1");
    }

    // Validate verification defaults
    if let Some(ps) = config.verification.page_size {
        if ps < 1 {
            anyhow::bail!("verification.page_size must be >= 1");
        }
    }

    // Validate provider
    match config.provider.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.provider.is_enabled() {
        if config.provider.embedding_model.is_none() {
            anyhow::bail!(
                "provider.embedding_model must be specified when provider is '{}'",
                config.provider.provider
            );
        }
        if config.provider.dims.is_none() || config.provider.dims == Some(0) {
            anyhow::bail!(
                "provider.dims must be > 0 when provider is '{}'",
                config.provider.provider
            );
        }
    }

    Ok(config)
}
