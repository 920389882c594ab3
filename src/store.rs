//! SQLite persistence for index snapshots and the usage counter.
//!
//! The whole snapshot and its usage increment are written in one
//! transaction, so a failed or interrupted save leaves the previous
//! snapshot and counter readable. Record order is stored
//! explicitly and restored on load.
//!
//! Tables:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `segments` | one row per record: segment fields plus the embedding blob |
//! | `meta` | key/value pairs: `model`, `dims`, `built_at`, `usage_count` |

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{RagError, Result};
use crate::index::{EmbeddingRecord, IndexSnapshot};
use crate::models::Segment;

const USAGE_KEY: &str = "usage_count";

#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RagError::Config(format!(
                        "cannot create index directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        debug!(path = %path.display(), "index store opened");
        Ok(store)
    }

    /// A private in-memory database. Single connection, since every
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS segments (
                position INTEGER PRIMARY KEY,
                id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                sequence_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                page INTEGER,
                char_offset INTEGER NOT NULL,
                hash TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_document_id ON segments(document_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the persisted snapshot with `snapshot` and add `usage` to the
    /// usage counter, atomically. Returns the new counter value.
    pub async fn save(&self, snapshot: &IndexSnapshot, usage: u64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM segments").execute(&mut *tx).await?;

        for (position, record) in snapshot.records().iter().enumerate() {
            let s = &record.segment;
            sqlx::query(
                "INSERT INTO segments (position, id, document_id, sequence_index, text, page, char_offset, hash, embedding) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(position as i64)
            .bind(&s.id)
            .bind(&s.document_id)
            .bind(s.sequence_index)
            .bind(&s.text)
            .bind(s.page.map(i64::from))
            .bind(s.offset as i64)
            .bind(&s.hash)
            .bind(vec_to_blob(&record.vector))
            .execute(&mut *tx)
            .await?;
        }

        for (key, value) in [
            ("model", snapshot.model().to_string()),
            ("dims", snapshot.dims().to_string()),
            ("built_at", snapshot.built_at().to_rfc3339()),
        ] {
            sqlx::query(
                "INSERT INTO meta (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?1, CAST(?2 AS TEXT)) \
             ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + ?2 AS TEXT)",
        )
        .bind(USAGE_KEY)
        .bind(usage as i64)
        .execute(&mut *tx)
        .await?;
        let total: String = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(USAGE_KEY)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        let total = total.parse().unwrap_or(0);
        debug!(segments = snapshot.len(), usage_count = total, "index snapshot persisted");
        Ok(total)
    }

    /// Load the persisted snapshot, or `None` if nothing was ever saved.
    pub async fn load(&self) -> Result<Option<IndexSnapshot>> {
        let Some(model) = self.meta("model").await? else {
            return Ok(None);
        };
        let dims: usize = self
            .meta("dims")
            .await?
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| RagError::IndexMismatch {
                message: "persisted index has no valid dimensionality".to_string(),
            })?;
        let built_at = self
            .meta("built_at")
            .await?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let rows = sqlx::query(
            "SELECT id, document_id, sequence_index, text, page, char_offset, hash, embedding \
             FROM segments ORDER BY position",
        )
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .iter()
            .map(|row| {
                let page: Option<i64> = row.get("page");
                let offset: i64 = row.get("char_offset");
                let blob: Vec<u8> = row.get("embedding");
                let segment = Segment {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    sequence_index: row.get("sequence_index"),
                    text: row.get("text"),
                    page: page.and_then(|p| u32::try_from(p).ok()),
                    offset: offset.max(0) as usize,
                    hash: row.get("hash"),
                };
                EmbeddingRecord::new(segment, blob_to_vec(&blob))
            })
            .collect();

        IndexSnapshot::from_records(records, model, dims, built_at).map(Some)
    }

    /// Documents ingested with the host's key so far.
    pub async fn usage_count(&self) -> Result<u64> {
        Ok(self
            .meta(USAGE_KEY)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn meta(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
