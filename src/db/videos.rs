//! Video records and the read-side video repository

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::sqlite_helpers::str_to_datetime;

/// Separator used when aggregating tag names into a single column
pub(crate) const TAG_SEPARATOR: char = '\u{1f}';

/// Column list shared by every query that returns a `VideoRecord`
pub(crate) const SELECT_VIDEO: &str = r#"
    SELECT v.id, v.file_path, v.file_name, v.thumbnail_id, v.duration, v.category,
           v.file_modified_at, v.created_at, v.updated_at,
           (SELECT group_concat(t.name, char(31)) FROM video_tags vt
                JOIN tags t ON t.id = vt.tag_id
                WHERE vt.video_id = v.id) AS tags
    FROM videos v
"#;

/// Video record from database
#[derive(Debug, Clone, PartialEq)]
pub struct VideoRecord {
    pub id: i64,
    /// Absolute path of the source file; unique
    pub file_path: String,
    pub file_name: String,
    pub thumbnail_id: String,
    /// Seconds, 0.0 when the probe failed
    pub duration: f64,
    pub category: Option<String>,
    /// Source file mtime as last observed by a scan
    pub file_modified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Attached tag names, sorted
    pub tags: Vec<String>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for VideoRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let file_modified_at: String = row.try_get("file_modified_at")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        let tags: Option<String> = row.try_get("tags")?;

        let mut tags: Vec<String> = tags
            .map(|joined| {
                joined
                    .split(TAG_SEPARATOR)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        tags.sort();

        Ok(Self {
            id: row.try_get("id")?,
            file_path: row.try_get("file_path")?,
            file_name: row.try_get("file_name")?,
            thumbnail_id: row.try_get("thumbnail_id")?,
            duration: row.try_get("duration")?,
            category: row.try_get("category")?,
            file_modified_at: str_to_datetime(&file_modified_at)
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            created_at: str_to_datetime(&created_at).map_err(|e| sqlx::Error::Decode(e.into()))?,
            updated_at: str_to_datetime(&updated_at).map_err(|e| sqlx::Error::Decode(e.into()))?,
            tags,
        })
    }
}

/// Input for creating a video record
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub file_path: String,
    pub file_name: String,
    pub thumbnail_id: String,
    pub duration: f64,
    pub file_modified_at: DateTime<Utc>,
}

/// Fields refreshed when the source file changed on disk
#[derive(Debug, Clone)]
pub struct VideoUpdate {
    pub file_name: String,
    pub thumbnail_id: String,
    pub duration: f64,
    pub file_modified_at: DateTime<Utc>,
}

/// Read-only access to videos outside of a scan
pub struct VideoRepository {
    pool: SqlitePool,
}

impl VideoRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// List videos ordered by file name. `page` is 1-based.
    pub async fn list(&self, page: u32, page_size: u32) -> Result<Vec<VideoRecord>> {
        let page_size = page_size.max(1);
        let offset = i64::from(page.max(1) - 1) * i64::from(page_size);

        let sql = format!("{SELECT_VIDEO} ORDER BY v.file_name, v.id LIMIT ?1 OFFSET ?2");
        let records = sqlx::query_as::<_, VideoRecord>(&sql)
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Count all videos
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM videos")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<VideoRecord>> {
        let sql = format!("{SELECT_VIDEO} WHERE v.id = ?1");
        let record = sqlx::query_as::<_, VideoRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn get_by_thumbnail_id(&self, thumbnail_id: &str) -> Result<Option<VideoRecord>> {
        let sql = format!("{SELECT_VIDEO} WHERE v.thumbnail_id = ?1");
        let record = sqlx::query_as::<_, VideoRecord>(&sql)
            .bind(thumbnail_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Option<VideoRecord>> {
        let sql = format!("{SELECT_VIDEO} WHERE v.file_path = ?1");
        let record = sqlx::query_as::<_, VideoRecord>(&sql)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Find videos carrying the given tags.
    ///
    /// With `match_all` a video must carry every tag, otherwise any one suffices.
    /// An empty tag list matches nothing.
    pub async fn search_by_tags(&self, tags: &[String], match_all: bool) -> Result<Vec<VideoRecord>> {
        let mut wanted: Vec<&String> = Vec::with_capacity(tags.len());
        for tag in tags {
            if !wanted.contains(&tag) {
                wanted.push(tag);
            }
        }
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=wanted.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let having = if match_all {
            format!("HAVING COUNT(DISTINCT t.name) = {}", wanted.len())
        } else {
            String::new()
        };
        let sql = format!(
            "{SELECT_VIDEO} WHERE v.id IN (
                SELECT vt.video_id FROM video_tags vt
                JOIN tags t ON t.id = vt.tag_id
                WHERE t.name IN ({placeholders})
                GROUP BY vt.video_id
                {having}
            )
            ORDER BY v.file_name, v.id"
        );

        let mut query = sqlx::query_as::<_, VideoRecord>(&sql);
        for tag in wanted {
            query = query.bind(tag);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, RecordStore};
    use pretty_assertions::assert_eq;

    async fn seeded() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(&dir.path().join("test.db")).await.unwrap();

        let mut store = db.begin_scan().await.unwrap();
        for (path, tags) in [
            ("/lib/c.mp4", vec!["Comedy", "funny"]),
            ("/lib/a.mp4", vec!["Comedy"]),
            ("/lib/b.mp4", vec!["funny", "live"]),
        ] {
            let video = store
                .insert(&NewVideo {
                    file_path: path.to_string(),
                    file_name: path.trim_start_matches("/lib/").to_string(),
                    thumbnail_id: format!("thumb-{path}"),
                    duration: 1.0,
                    file_modified_at: Utc::now(),
                })
                .await
                .unwrap();
            let tags: Vec<String> = tags.into_iter().map(String::from).collect();
            store.replace_tags(video.id, &tags).await.unwrap();
        }
        store.commit().await.unwrap();
        (dir, db)
    }

    fn names(records: &[VideoRecord]) -> Vec<&str> {
        records.iter().map(|r| r.file_name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_list_is_paged_by_file_name() {
        let (_dir, db) = seeded().await;
        let videos = db.videos();

        assert_eq!(videos.count().await.unwrap(), 3);
        assert_eq!(names(&videos.list(1, 2).await.unwrap()), vec!["a.mp4", "b.mp4"]);
        assert_eq!(names(&videos.list(2, 2).await.unwrap()), vec!["c.mp4"]);
        assert!(videos.list(3, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_thumbnail_id() {
        let (_dir, db) = seeded().await;
        let videos = db.videos();

        let b = videos.get_by_path("/lib/b.mp4").await.unwrap().unwrap();
        assert_eq!(b.tags, vec!["funny".to_string(), "live".to_string()]);
        assert_eq!(videos.get_by_id(b.id).await.unwrap(), Some(b.clone()));
        assert_eq!(
            videos.get_by_thumbnail_id(&b.thumbnail_id).await.unwrap(),
            Some(b)
        );
        assert_eq!(videos.get_by_id(9999).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_search_any_and_all() {
        let (_dir, db) = seeded().await;
        let videos = db.videos();
        let tags = |t: &[&str]| t.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let any = videos.search_by_tags(&tags(&["funny", "Comedy"]), false).await.unwrap();
        assert_eq!(names(&any), vec!["a.mp4", "b.mp4", "c.mp4"]);

        let all = videos.search_by_tags(&tags(&["funny", "Comedy"]), true).await.unwrap();
        assert_eq!(names(&all), vec!["c.mp4"]);

        let dup = videos.search_by_tags(&tags(&["live", "live"]), true).await.unwrap();
        assert_eq!(names(&dup), vec!["b.mp4"]);

        assert!(videos.search_by_tags(&[], false).await.unwrap().is_empty());
        assert!(videos.search_by_tags(&tags(&["comedy"]), false).await.unwrap().is_empty());
    }
}
