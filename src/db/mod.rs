//! Database connection and repositories
//!
//! SQLite through sqlx. The schema is created idempotently on connect.

pub mod sqlite_helpers;
pub mod store;
pub mod tags;
pub mod videos;

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

pub use store::{RecordStore, SqliteRecordStore};
pub use tags::{TagRecord, TagRepository};
pub use videos::{NewVideo, VideoRecord, VideoRepository, VideoUpdate};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS videos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL UNIQUE,
    file_name TEXT NOT NULL,
    thumbnail_id TEXT NOT NULL,
    duration REAL NOT NULL DEFAULT 0,
    category TEXT,
    file_modified_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_videos_thumbnail_id ON videos(thumbnail_id);
CREATE INDEX IF NOT EXISTS idx_videos_file_name ON videos(file_name);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS video_tags (
    video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (video_id, tag_id)
);
CREATE INDEX IF NOT EXISTS idx_video_tags_tag_id ON video_tags(tag_id);
"#;

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database file and ensure the schema exists
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory '{}'", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database '{}'", path.display()))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("Failed to create database schema")?;

        info!(path = %path.display(), "Database ready");
        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get a video repository
    pub fn videos(&self) -> VideoRepository {
        VideoRepository::new(self.pool.clone())
    }

    /// Get a tag repository
    pub fn tags(&self) -> TagRepository {
        TagRepository::new(self.pool.clone())
    }

    /// Open a transaction-scoped record store for one reconciliation pass
    pub async fn begin_scan(&self) -> Result<SqliteRecordStore> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin scan transaction")?;
        Ok(SqliteRecordStore::new(tx))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_is_idempotent_and_enforces_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vidshelf.db");

        let db = Database::connect(&path).await.unwrap();
        db.close().await;
        let db = Database::connect(&path).await.unwrap();

        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);

        let orphan = sqlx::query("INSERT INTO video_tags (video_id, tag_id) VALUES (1, 1)")
            .execute(db.pool())
            .await;
        assert!(orphan.is_err());
    }
}
