//! SQLite [`FactStore`] implementation.
//!
//! Keyword search uses an FTS5 index over fact content; vector search
//! stores embeddings as little-endian f32 BLOBs and computes cosine
//! similarity in Rust. Verification state transitions use a conditional
//! `UPDATE ... WHERE state = ?`, which linearizes concurrent reviews at the
//! database layer.

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::debug;

use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::models::{CandidateFilter, Fact, FactCandidate, VerificationConfig, VerificationState};
use crate::provider::{blob_to_vec, cosine_similarity, vec_to_blob};

use super::FactStore;

const SNIPPET_CHARS: i64 = 240;
const VERIFICATION_KEY: &str = "verification";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the database at the configured path, creating it (and its
    /// parent directory) if missing. WAL mode keeps readers unblocked
    /// during review-queue writes.
    pub async fn connect(db: &DbConfig) -> Result<Self> {
        if let Some(parent) = db.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db.path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Quote each term so user text can never be parsed as FTS5 syntax.
fn fts_query(text: &str) -> String {
    text.split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn row_to_fact(row: &SqliteRow) -> Result<Fact> {
    let state: String = row.get("state");
    let access: String = row.get("access_level");
    let tags: String = row.get("tags");
    let group_ids: String = row.get("group_ids");
    let shared_with: String = row.get("shared_with");
    let preserve: i64 = row.get("preserve");

    Ok(Fact {
        id: row.get("id"),
        content: row.get("content"),
        title: row.get("title"),
        source: row.get("source"),
        category: row.get("category"),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        access_level: access.parse()?,
        owner_id: row.get("owner_id"),
        organization_id: row.get("organization_id"),
        group_ids: serde_json::from_str(&group_ids).unwrap_or_default(),
        shared_with: serde_json::from_str(&shared_with).unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        state: VerificationState::from_str(&state)?,
        reviewed_by: row.get("reviewed_by"),
        session_id: row.get("session_id"),
        preserve: preserve != 0,
        dedup_hash: row.get("dedup_hash"),
    })
}

#[async_trait]
impl FactStore for SqliteStore {
    async fn put_fact(&self, fact: &Fact) -> Result<()> {
        let tags = serde_json::to_string(&fact.tags)?;
        let group_ids = serde_json::to_string(&fact.group_ids)?;
        let shared_with = serde_json::to_string(&fact.shared_with)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO facts (id, content, title, source, category, tags, access_level,
                               owner_id, organization_id, group_ids, shared_with,
                               created_at, updated_at, state, reviewed_by,
                               session_id, preserve, dedup_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                title = excluded.title,
                source = excluded.source,
                category = excluded.category,
                tags = excluded.tags,
                access_level = excluded.access_level,
                owner_id = excluded.owner_id,
                organization_id = excluded.organization_id,
                group_ids = excluded.group_ids,
                shared_with = excluded.shared_with,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                state = excluded.state,
                reviewed_by = excluded.reviewed_by,
                session_id = excluded.session_id,
                preserve = excluded.preserve,
                dedup_hash = excluded.dedup_hash
            "#,
        )
        .bind(&fact.id)
        .bind(&fact.content)
        .bind(&fact.title)
        .bind(&fact.source)
        .bind(&fact.category)
        .bind(&tags)
        .bind(fact.access_level.as_str())
        .bind(&fact.owner_id)
        .bind(&fact.organization_id)
        .bind(&group_ids)
        .bind(&shared_with)
        .bind(fact.created_at)
        .bind(fact.updated_at)
        .bind(fact.state.as_str())
        .bind(&fact.reviewed_by)
        .bind(&fact.session_id)
        .bind(fact.preserve as i64)
        .bind(&fact.dedup_hash)
        .execute(&mut *tx)
        .await?;

        // Refresh the FTS entry
        sqlx::query("DELETE FROM facts_fts WHERE fact_id = ?")
            .bind(&fact.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO facts_fts (fact_id, content) VALUES (?, ?)")
            .bind(&fact.id)
            .bind(&fact.content)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(fact_id = %fact.id, state = fact.state.as_str(), "fact stored");
        Ok(())
    }

    async fn get_fact(&self, id: &str) -> Result<Option<Fact>> {
        let row = sqlx::query("SELECT * FROM facts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_fact(&r)).transpose()
    }

    async fn set_state(
        &self,
        id: &str,
        expected: VerificationState,
        new: VerificationState,
        reviewer: &str,
    ) -> Result<bool> {
        // Reviewer identity is recorded in the same conditional write that
        // decides the race, so the stored name is always the winner's.
        let result = sqlx::query(
            "UPDATE facts SET state = ?, reviewed_by = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(new.as_str())
        .bind(reviewer)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_fact(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM facts_fts WHERE fact_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM fact_vectors WHERE fact_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM facts WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_dedup_hash(&self, hash: &str) -> Result<Option<Fact>> {
        if hash.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query("SELECT * FROM facts WHERE dedup_hash = ? LIMIT 1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_fact).transpose()
    }

    async fn upsert_vector(&self, fact_id: &str, vector: &[f32], model: &str) -> Result<()> {
        let blob = vec_to_blob(vector);
        sqlx::query(
            r#"
            INSERT INTO fact_vectors (fact_id, embedding, model, dims) VALUES (?, ?, ?, ?)
            ON CONFLICT(fact_id) DO UPDATE SET
                embedding = excluded.embedding,
                model = excluded.model,
                dims = excluded.dims
            "#,
        )
        .bind(fact_id)
        .bind(&blob)
        .bind(model)
        .bind(vector.len() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn keyword_search(
        &self,
        text: &str,
        filter: &CandidateFilter,
        limit: i64,
    ) -> Result<Vec<FactCandidate>> {
        let match_expr = fts_query(text);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        // Over-fetch so visibility filtering still fills the requested limit.
        let rows = sqlx::query(
            r#"
            SELECT f.*, facts_fts.rank AS rank,
                   snippet(facts_fts, 1, '>>>', '<<<', '...', 48) AS snip
            FROM facts_fts
            JOIN facts f ON f.id = facts_fts.fact_id
            WHERE facts_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(limit * 4)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::new();
        for row in &rows {
            let fact = row_to_fact(row)?;
            if !filter.admits(&fact) {
                continue;
            }
            let rank: f64 = row.get("rank");
            candidates.push(FactCandidate {
                fact_id: fact.id,
                raw_score: -rank, // negate so higher = better
                snippet: row.get("snip"),
            });
            if candidates.len() as i64 >= limit {
                break;
            }
        }
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &CandidateFilter,
        limit: i64,
    ) -> Result<Vec<FactCandidate>> {
        // Brute-force cosine over all stored vectors, filtered in Rust.
        let rows = sqlx::query(
            r#"
            SELECT f.*, v.embedding,
                   COALESCE(substr(f.content, 1, ?), '') AS snip
            FROM fact_vectors v
            JOIN facts f ON f.id = v.fact_id
            "#,
        )
        .bind(SNIPPET_CHARS)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::new();
        for row in &rows {
            let fact = row_to_fact(row)?;
            if !filter.admits(&fact) {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            let score = cosine_similarity(query_vec, &vec) as f64;
            if score <= 0.0 {
                continue;
            }
            candidates.push(FactCandidate {
                fact_id: fact.id,
                raw_score: score,
                snippet: row.get("snip"),
            });
        }
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
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facts WHERE state = 'pending'")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM facts
            WHERE state = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let facts = rows
            .iter()
            .map(row_to_fact)
            .collect::<Result<Vec<Fact>>>()?;
        Ok((facts, total))
    }

    async fn session_facts(&self, session_id: &str) -> Result<Vec<Fact>> {
        let rows = sqlx::query(
            "SELECT * FROM facts WHERE session_id = ? ORDER BY created_at DESC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_fact).collect()
    }

    async fn set_preserve(&self, session_id: &str, fact_id: &str, preserve: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE facts SET preserve = ?, updated_at = ? WHERE id = ? AND session_id = ?",
        )
        .bind(preserve as i64)
        .bind(chrono::Utc::now().timestamp())
        .bind(fact_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn detach_session(&self, fact_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE facts SET session_id = NULL, preserve = 0, updated_at = ?
            WHERE id = ? AND session_id IS NOT NULL
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(fact_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_verification_config(&self) -> Result<Option<VerificationConfig>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(VERIFICATION_KEY)
            .fetch_optional(&self.pool)
            .await?;
        value
            .map(|v| serde_json::from_str(&v).map_err(Into::into))
            .transpose()
    }

    async fn save_verification_config(&self, cfg: &VerificationConfig) -> Result<()> {
        let value = serde_json::to_string(cfg)?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(VERIFICATION_KEY)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("quarterly report"), r#""quarterly" OR "report""#);
        assert_eq!(fts_query(r#"say "hi""#), r#""say" OR """hi""""#);
        assert_eq!(fts_query("  "), "");
    }
}
