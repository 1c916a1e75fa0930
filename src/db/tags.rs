//! Tag listing

use anyhow::Result;
use sqlx::SqlitePool;

/// Tag with the number of videos referencing it
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TagRecord {
    pub id: i64,
    pub name: String,
    pub video_count: i64,
}

pub struct TagRepository {
    pool: SqlitePool,
}

impl TagRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// List all tags ordered by name
    pub async fn list(&self) -> Result<Vec<TagRecord>> {
        let records = sqlx::query_as::<_, TagRecord>(
            r#"
            SELECT t.id, t.name, COUNT(vt.video_id) AS video_count
            FROM tags t
            LEFT JOIN video_tags vt ON vt.tag_id = t.id
            GROUP BY t.id, t.name
            ORDER BY t.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
