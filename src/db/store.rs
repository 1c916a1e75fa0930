//! Transactional record store used by the scanner
//!
//! A reconciliation pass runs every read and write through one `RecordStore`.
//! Nothing becomes visible to other connections until `commit`; `rollback`
//! (or dropping the store) leaves the database exactly as it was.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use sqlx::{Sqlite, SqliteConnection, Transaction};

use crate::db::sqlite_helpers::{datetime_to_str, now_iso8601};
use crate::db::videos::{NewVideo, SELECT_VIDEO, VideoRecord, VideoUpdate};

/// Persistent storage of video records and tags, scoped to one pass
#[async_trait]
pub trait RecordStore: Send {
    async fn find_by_path(&mut self, path: &str) -> Result<Option<VideoRecord>>;

    async fn list_all(&mut self) -> Result<Vec<VideoRecord>>;

    async fn insert(&mut self, video: &NewVideo) -> Result<VideoRecord>;

    /// Refresh the file-derived fields of an existing record
    async fn update(&mut self, id: i64, changes: &VideoUpdate) -> Result<()>;

    /// Delete a record together with its tag links
    async fn delete(&mut self, id: i64) -> Result<()>;

    async fn set_category(&mut self, id: i64, category: Option<&str>) -> Result<()>;

    /// Replace the tag set of a video, creating tags by name as needed
    async fn replace_tags(&mut self, id: i64, tags: &[String]) -> Result<()>;

    /// Delete tags referenced by no video. Returns the number removed.
    async fn delete_unused_tags(&mut self) -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// `RecordStore` over a single SQLite transaction
pub struct SqliteRecordStore {
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteRecordStore {
    pub fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self { tx: Some(tx) }
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| anyhow!("Record store transaction already finished"))
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn find_by_path(&mut self, path: &str) -> Result<Option<VideoRecord>> {
        let sql = format!("{SELECT_VIDEO} WHERE v.file_path = ?1");
        let record = sqlx::query_as::<_, VideoRecord>(&sql)
            .bind(path)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(record)
    }

    async fn list_all(&mut self) -> Result<Vec<VideoRecord>> {
        let sql = format!("{SELECT_VIDEO} ORDER BY v.id");
        let records = sqlx::query_as::<_, VideoRecord>(&sql)
            .fetch_all(self.conn()?)
            .await?;
        Ok(records)
    }

    async fn insert(&mut self, video: &NewVideo) -> Result<VideoRecord> {
        let now = now_iso8601();
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO videos (file_path, file_name, thumbnail_id, duration,
                                file_modified_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            RETURNING id
            "#,
        )
        .bind(&video.file_path)
        .bind(&video.file_name)
        .bind(&video.thumbnail_id)
        .bind(video.duration)
        .bind(datetime_to_str(video.file_modified_at))
        .bind(&now)
        .fetch_one(self.conn()?)
        .await
        .with_context(|| format!("Failed to insert video '{}'", video.file_path))?;

        let sql = format!("{SELECT_VIDEO} WHERE v.id = ?1");
        let record = sqlx::query_as::<_, VideoRecord>(&sql)
            .bind(id)
            .fetch_one(self.conn()?)
            .await?;
        Ok(record)
    }

    async fn update(&mut self, id: i64, changes: &VideoUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE videos
            SET file_name = ?2, thumbnail_id = ?3, duration = ?4,
                file_modified_at = ?5, updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&changes.file_name)
        .bind(&changes.thumbnail_id)
        .bind(changes.duration)
        .bind(datetime_to_str(changes.file_modified_at))
        .bind(now_iso8601())
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn delete(&mut self, id: i64) -> Result<()> {
        // video_tags rows follow through ON DELETE CASCADE
        sqlx::query("DELETE FROM videos WHERE id = ?1")
            .bind(id)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn set_category(&mut self, id: i64, category: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE videos SET category = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(category)
            .bind(now_iso8601())
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn replace_tags(&mut self, id: i64, tags: &[String]) -> Result<()> {
        let conn = self.conn()?;

        sqlx::query("DELETE FROM video_tags WHERE video_id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        for name in tags {
            sqlx::query("INSERT INTO tags (name) VALUES (?1) ON CONFLICT(name) DO NOTHING")
                .bind(name)
                .execute(&mut *conn)
                .await?;
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO video_tags (video_id, tag_id)
                SELECT ?1, id FROM tags WHERE name = ?2
                "#,
            )
            .bind(id)
            .bind(name)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query("UPDATE videos SET updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(now_iso8601())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn delete_unused_tags(&mut self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM tags WHERE id NOT IN (SELECT DISTINCT tag_id FROM video_tags)",
        )
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| anyhow!("Record store transaction already finished"))?;
        tx.commit().await.context("Failed to commit scan")?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await.context("Failed to roll back scan")?;
        }
        Ok(())
    }
}
