//! Embedding and synthesis collaborator abstraction.
//!
//! Defines the [`ModelProvider`] trait and two implementations:
//! - **[`DisabledProvider`]** — used when no provider is configured; the
//!   retrieval engine skips the vector channel entirely.
//! - **[`OpenAiProvider`]** — calls an OpenAI-compatible API with retry and
//!   exponential backoff.
//!
//! Also provides vector utilities shared by the store backends:
//! [`cosine_similarity`], [`vec_to_blob`], and [`blob_to_vec`].
//!
//! # Retry Strategy
//!
//! Transient upstream errors are retried with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! All failures surface as [`Error::UpstreamUnavailable`] so callers can
//! apply their own backoff; the provider never converts a timeout into a
//! document state change.

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::SearchResultItem;

/// Output of the synthesis collaborator.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub answer: String,
    /// Ids of the grounding facts the collaborator reports actually using.
    pub sources_used: Vec<String>,
    pub confidence: f64,
}

/// External embedding/synthesis collaborator boundary.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// False for [`DisabledProvider`]; the vector channel and RAG are
    /// unavailable (not degraded) in that case.
    fn is_enabled(&self) -> bool;

    /// Embed a single text into a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Rewrite a query for better retrieval. Callers fall back to the
    /// original text on failure.
    async fn reformulate_query(&self, text: &str) -> Result<String>;

    /// Produce an answer grounded in the given results.
    async fn synthesize(&self, query: &str, sources: &[SearchResultItem]) -> Result<Synthesis>;
}

// ============ Disabled provider ============

/// No-op provider used when `provider = "disabled"`.
pub struct DisabledProvider;

#[async_trait]
impl ModelProvider for DisabledProvider {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::upstream("model provider is disabled"))
    }

    async fn reformulate_query(&self, _text: &str) -> Result<String> {
        Err(Error::upstream("model provider is disabled"))
    }

    async fn synthesize(&self, _query: &str, _sources: &[SearchResultItem]) -> Result<Synthesis> {
        Err(Error::upstream("model provider is disabled"))
    }
}

// ============ OpenAI-compatible provider ============

/// Provider backed by an OpenAI-compatible HTTP API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiProvider {
    config: ProviderConfig,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        if config.embedding_model.is_none() {
            return Err(Error::Config(
                "provider.embedding_model required for openai provider".into(),
            ));
        }
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY environment variable not set".into()))?;
        Ok(Self {
            config: config.clone(),
            api_key,
        })
    }

    /// POST with retry/backoff, returning the parsed JSON body.
    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;
        let url = format!("{}{}", self.config.api_base, path);

        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .map_err(|e| Error::upstream(format!("invalid response body: {}", e)));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(Error::upstream(format!(
                            "provider error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    return Err(Error::upstream(format!(
                        "provider error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(Error::upstream(format!("provider request failed: {}", e)));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::upstream("provider call failed after retries")))
    }

    async fn chat_completion(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let model = self
            .config
            .synthesis_model
            .clone()
            .ok_or_else(|| Error::Config("provider.synthesis_model required".into()))?;

        let body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let json = self.post_json("/chat/completions", &body, timeout).await?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::upstream("invalid completion response: missing content"))
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = self
            .config
            .embedding_model
            .clone()
            .ok_or_else(|| Error::Config("provider.embedding_model required".into()))?;

        let body = serde_json::json!({
            "model": model,
            "input": [text],
        });

        let timeout = Duration::from_secs(self.config.embed_timeout_secs);
        let json = self.post_json("/embeddings", &body, timeout).await?;

        let embedding = json
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|item| item.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::upstream("invalid embedding response: missing data"))?;

        Ok(embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect())
    }

    async fn reformulate_query(&self, text: &str) -> Result<String> {
        let prompt = format!(
            "Rewrite the following knowledge-base search query to maximize retrieval recall. \
             Reply with the rewritten query only, no explanation.\n\nQuery: {}",
            text
        );
        let timeout = Duration::from_secs(self.config.synth_timeout_secs);
        let rewritten = self.chat_completion(&prompt, timeout).await?;
        Ok(rewritten.trim().to_string())
    }

    async fn synthesize(&self, query: &str, sources: &[SearchResultItem]) -> Result<Synthesis> {
        let mut listing = String::new();
        for s in sources {
            listing.push_str(&format!("[{}] {}\n", s.id, s.snippet.replace('\n', " ")));
        }
        let prompt = format!(
            "Answer the question using only the sources below. Reply with strict JSON: \
             {{\"answer\": string, \"source_ids\": [string], \"confidence\": number in [0,1]}}. \
             List in source_ids only the sources you actually used; if none are usable, \
             return an empty answer with an empty source_ids list.\n\n\
             Question: {}\n\nSources:\n{}",
            query, listing
        );

        let timeout = Duration::from_secs(self.config.synth_timeout_secs);
        let content = self.chat_completion(&prompt, timeout).await?;

        match serde_json::from_str::<serde_json::Value>(content.trim()) {
            Ok(parsed) => {
                let answer = parsed
                    .get("answer")
                    .and_then(|a| a.as_str())
                    .unwrap_or_default()
                    .to_string();
                let sources_used = parsed
                    .get("source_ids")
                    .and_then(|s| s.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                let confidence = parsed
                    .get("confidence")
                    .and_then(|c| c.as_f64())
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                Ok(Synthesis {
                    answer,
                    sources_used,
                    confidence,
                })
            }
            Err(e) => {
                // Collaborator ignored the JSON contract; keep the text but
                // attribute conservatively.
                warn!(error = %e, "non-JSON synthesis response, using raw text");
                Ok(Synthesis {
                    answer: content.trim().to_string(),
                    sources_used: sources.iter().map(|s| s.id.clone()).collect(),
                    confidence: 0.5,
                })
            }
        }
    }
}

/// Create the configured [`ModelProvider`].
pub fn create_provider(config: &ProviderConfig) -> Result<Box<dyn ModelProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAiProvider::new(config)?)),
        other => Err(Error::Config(format!("unknown provider: {}", other))),
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
