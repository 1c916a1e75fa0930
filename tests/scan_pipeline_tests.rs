//! Integration tests for the scan pipeline
//!
//! These tests run real reconciliation passes against a scratch library and a
//! file-backed SQLite database:
//! - New, modified and removed files
//! - Sidecar and directory metadata
//! - Transaction rollback on unavailable roots
//! - Thumbnail scheduling through the worker
//!
//! ffmpeg is never invoked: durations come from a stub probe and thumbnails
//! from a stub executor that writes a placeholder artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use assert_matches::assert_matches;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use vidshelf::config::{Config, Isolation};
use vidshelf::db::{Database, VideoRecord};
use vidshelf::services::paths::normalize;
use vidshelf::services::{
    ClipSettings, MediaProbe, ScanError, ScannerService, TaskState, ThumbnailExecutor,
    ThumbnailTask, ThumbnailWorker, thumbnail_id,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

struct StubProbe;

#[async_trait]
impl MediaProbe for StubProbe {
    async fn duration_secs(&self, _path: &Path) -> Result<f64> {
        Ok(42.0)
    }
}

#[derive(Default)]
struct StubExecutor {
    calls: AtomicUsize,
    delay_ms: AtomicU64,
}

#[async_trait]
impl ThumbnailExecutor for StubExecutor {
    async fn execute(&self, task: &ThumbnailTask, _settings: &ClipSettings) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if let Some(parent) = task.dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&task.dest, b"GIF89a")?;
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    library: PathBuf,
    config_path: PathBuf,
    db: Database,
    executor: Arc<StubExecutor>,
    worker: Arc<ThumbnailWorker>,
    scanner: ScannerService,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("lib");
        std::fs::create_dir_all(&library).unwrap();

        let mut config = Config::default();
        config.video_directories = vec![library.clone()];
        config.database.path = dir.path().join("vidshelf.db");
        config.thumbnails.directory = dir.path().join("thumbs");
        config.thumbnails.max_workers = 2;
        config.thumbnails.isolation = Isolation::InProcess;
        config.thumbnails.shutdown_grace_ms = 100;

        let config_path = dir.path().join("config.yaml");
        write_config(&config_path, &config);

        let db = Database::connect(&config.database.path).await.unwrap();
        let executor = Arc::new(StubExecutor::default());
        let worker = Arc::new(ThumbnailWorker::new(
            config.thumbnails.clone(),
            executor.clone(),
        ));
        let scanner = ScannerService::with_probe(
            db.clone(),
            worker.clone(),
            Arc::new(config),
            Some(config_path.clone()),
            Arc::new(StubProbe),
        );

        Self {
            _dir: dir,
            library,
            config_path,
            db,
            executor,
            worker,
            scanner,
        }
    }

    fn add_file(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.library.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        normalize(&path)
    }

    fn update_config(&self, edit: impl FnOnce(&mut Config)) {
        let raw = std::fs::read_to_string(&self.config_path).unwrap();
        let mut config: Config = serde_yaml::from_str(&raw).unwrap();
        edit(&mut config);
        write_config(&self.config_path, &config);
    }

    async fn record(&self, path: &Path) -> Option<VideoRecord> {
        self.db
            .videos()
            .get_by_path(&path.to_string_lossy())
            .await
            .unwrap()
    }

    fn artifact(&self, video: &Path) -> PathBuf {
        self.scanner
            .config()
            .thumbnails
            .artifact_path(&thumbnail_id(&video.to_string_lossy()))
    }

    async fn tag_names(&self) -> Vec<String> {
        self.db
            .tags()
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect()
    }
}

fn write_config(path: &Path, config: &Config) {
    std::fs::write(path, serde_yaml::to_string(config).unwrap()).unwrap();
}

fn bump_mtime(path: &Path) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
}

#[tokio::test]
async fn test_new_video_gets_sidecar_and_directory_metadata() {
    let h = Harness::new().await;
    let video = h.add_file("Comedy/a.mp4", b"video");
    h.add_file("Comedy/a.info", b"!StandUp\n#funny\n");

    let summary = h.scanner.scan().await.unwrap();
    assert_eq!(summary.files_seen, 1);
    assert_eq!(summary.added, 1);
    assert_eq!(summary.thumbnails_queued, 1);

    let record = h.record(&video).await.unwrap();
    assert_eq!(record.file_name, "a.mp4");
    assert_eq!(record.category.as_deref(), Some("StandUp"));
    assert_eq!(record.tags, vec!["Comedy".to_string(), "funny".to_string()]);
    assert_eq!(record.duration, 42.0);
    assert_eq!(record.thumbnail_id, thumbnail_id(&video.to_string_lossy()));
    assert_eq!(record.thumbnail_id.len(), 32);

    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);
    assert_eq!(h.worker.status_of(&record.thumbnail_id), Some(TaskState::Succeeded));
    assert!(h.artifact(&video).exists());

    let found = h
        .db
        .videos()
        .search_by_tags(&["funny".to_string(), "Comedy".to_string()], true)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    h.worker.stop().await;
}

#[tokio::test]
async fn test_indexed_video_is_found_by_id_and_thumbnail_id() {
    let h = Harness::new().await;
    let video = h.add_file("Docs/p.mp4", b"video");
    h.scanner.scan().await.unwrap();

    let record = h.record(&video).await.unwrap();
    let by_id = h.db.videos().get_by_id(record.id).await.unwrap().unwrap();
    let by_thumbnail = h
        .db
        .videos()
        .get_by_thumbnail_id(&record.thumbnail_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(by_id.file_path, record.file_path);
    assert_eq!(by_thumbnail.id, record.id);
    assert_eq!(by_thumbnail.tags, vec!["Docs".to_string()]);
    assert!(h.db.videos().get_by_id(record.id + 1).await.unwrap().is_none());
    h.worker.stop().await;
}

#[tokio::test]
async fn test_rescan_without_changes_writes_nothing() {
    let h = Harness::new().await;
    let video = h.add_file("Drama/b.mkv", b"video");
    h.add_file("Drama/b.info", b"#slow");

    h.scanner.scan().await.unwrap();
    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);
    let before = h.record(&video).await.unwrap();

    let summary = h.scanner.scan().await.unwrap();
    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);
    let after = h.record(&video).await.unwrap();

    assert_eq!(summary.added, 0);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.metadata_changed, 0);
    assert_eq!(summary.removed, 0);
    assert_eq!(summary.thumbnails_queued, 0);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    h.worker.stop().await;
}

#[tokio::test]
async fn test_modified_video_is_updated_and_regenerated() {
    let h = Harness::new().await;
    let video = h.add_file("c.mp4", b"video");

    h.scanner.scan().await.unwrap();
    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);
    let before = h.record(&video).await.unwrap();

    bump_mtime(&video);
    let summary = h.scanner.scan().await.unwrap();
    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);

    let after = h.record(&video).await.unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.thumbnails_queued, 1);
    assert!(after.file_modified_at > before.file_modified_at);
    assert_eq!(after.id, before.id);
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 2);
    h.worker.stop().await;
}

#[tokio::test]
async fn test_sidecar_change_updates_metadata_only() {
    let h = Harness::new().await;
    let video = h.add_file("d.mp4", b"video");
    let sidecar = h.add_file("d.info", b"!Music\n#live");

    h.scanner.scan().await.unwrap();
    std::fs::write(&sidecar, b"#studio").unwrap();

    let summary = h.scanner.scan().await.unwrap();
    let record = h.record(&video).await.unwrap();

    assert_eq!(summary.updated, 0);
    assert_eq!(summary.metadata_changed, 1);
    assert_eq!(summary.tags_removed, 1);
    assert_eq!(record.category.as_deref(), Some("Music"));
    assert_eq!(record.tags, vec!["studio".to_string()]);
    assert_eq!(h.tag_names().await, vec!["studio".to_string()]);

    std::fs::write(&sidecar, b"!Live\n#studio").unwrap();
    let summary = h.scanner.scan().await.unwrap();
    let record = h.record(&video).await.unwrap();
    assert_eq!(summary.metadata_changed, 1);
    assert_eq!(record.category.as_deref(), Some("Live"));
    h.worker.stop().await;
}

#[tokio::test]
async fn test_unreadable_sidecar_keeps_category() {
    let h = Harness::new().await;
    let video = h.add_file("Comedy/o.mp4", b"video");
    let sidecar = h.add_file("Comedy/o.info", b"!StandUp\n#funny");

    h.scanner.scan().await.unwrap();
    std::fs::write(&sidecar, b"!Stand\xffUp\n#funny").unwrap();

    let summary = h.scanner.scan().await.unwrap();
    let record = h.record(&video).await.unwrap();

    assert_eq!(summary.updated, 0);
    assert_eq!(record.category.as_deref(), Some("StandUp"));
    assert_eq!(record.tags, vec!["Comedy".to_string()]);
    h.worker.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_non_utf8_file_name_is_skipped() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let h = Harness::new().await;
    std::fs::write(h.library.join(OsStr::from_bytes(b"caf\xe9.mp4")), b"video").unwrap();
    let video = h.add_file("cafe.mp4", b"video");

    for _ in 0..2 {
        let summary = h.scanner.scan().await.unwrap();
        assert_eq!(summary.files_seen, 1);
        assert_eq!(summary.removed, 0);
    }
    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);

    assert_eq!(h.db.videos().count().await.unwrap(), 1);
    assert!(h.record(&video).await.is_some());
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    h.worker.stop().await;
}

#[tokio::test]
async fn test_deleted_video_removes_record_and_artifact() {
    let h = Harness::new().await;
    let keep = h.add_file("Shows/keep.mp4", b"video");
    let gone = h.add_file("Shows/gone.mp4", b"video");
    h.add_file("Shows/gone.info", b"#only-here");

    h.scanner.scan().await.unwrap();
    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);
    assert!(h.artifact(&gone).exists());

    std::fs::remove_file(&gone).unwrap();
    let summary = h.scanner.scan().await.unwrap();

    assert_eq!(summary.removed, 1);
    assert_eq!(summary.tags_removed, 1);
    assert!(h.record(&gone).await.is_none());
    assert!(h.record(&keep).await.is_some());
    assert!(!h.artifact(&gone).exists());
    assert!(h.artifact(&keep).exists());
    assert_eq!(h.tag_names().await, vec!["Shows".to_string()]);
    h.worker.stop().await;
}

#[tokio::test]
async fn test_deleted_video_cancels_pending_thumbnail() {
    let h = Harness::new().await;
    h.executor.delay_ms.store(10_000, Ordering::SeqCst);
    let video = h.add_file("slow.mp4", b"video");

    h.scanner.scan().await.unwrap();
    let id = h.record(&video).await.unwrap().thumbnail_id;
    assert_matches!(
        h.worker.status_of(&id),
        Some(TaskState::Queued | TaskState::InFlight)
    );

    std::fs::remove_file(&video).unwrap();
    let summary = h.scanner.scan().await.unwrap();

    assert_eq!(summary.removed, 1);
    assert_eq!(h.worker.status_of(&id), Some(TaskState::Cancelled));
    assert!(h.worker.wait_idle(Duration::from_secs(1)).await);
    assert!(!h.artifact(&video).exists());
    h.worker.stop().await;
}

#[tokio::test]
async fn test_removed_root_purges_its_records() {
    let h = Harness::new().await;
    let other_root = h.library.parent().unwrap().join("other");
    std::fs::create_dir_all(&other_root).unwrap();
    let other = normalize(&other_root.join("e.mov"));
    std::fs::write(&other, b"video").unwrap();
    let local = h.add_file("f.mp4", b"video");

    let roots = vec![h.library.clone(), other_root.clone()];
    h.update_config(|c| c.video_directories = roots);
    let summary = h.scanner.scan().await.unwrap();
    assert_eq!(summary.added, 2);

    let library = h.library.clone();
    h.update_config(|c| c.video_directories = vec![library]);
    let summary = h.scanner.scan().await.unwrap();

    assert_eq!(summary.removed, 1);
    assert!(h.record(&other).await.is_none());
    assert!(h.record(&local).await.is_some());
    h.worker.stop().await;
}

#[tokio::test]
async fn test_unavailable_root_rolls_back() {
    let h = Harness::new().await;
    let video = h.add_file("g.mp4", b"video");
    h.scanner.scan().await.unwrap();
    assert_eq!(h.db.videos().count().await.unwrap(), 1);

    std::fs::remove_file(&video).unwrap();
    let missing = h.library.parent().unwrap().join("unmounted");
    let roots = vec![h.library.clone(), missing];
    h.update_config(|c| c.video_directories = roots);

    let err = h.scanner.scan().await.unwrap_err();
    assert_matches!(err, ScanError::RootUnavailable { .. });
    assert!(h.record(&video).await.is_some());
    h.worker.stop().await;
}

#[tokio::test]
async fn test_store_failure_rolls_back_pass() {
    let h = Harness::new().await;
    let old = h.add_file("old.mp4", b"video");
    h.add_file("old.info", b"#kept");
    h.scanner.scan().await.unwrap();
    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);

    sqlx::query(
        "CREATE TRIGGER refuse_delete BEFORE DELETE ON videos \
         BEGIN SELECT RAISE(ABORT, 'delete refused'); END",
    )
    .execute(h.db.pool())
    .await
    .unwrap();

    // The pass inserts the new file before it fails on the removal
    std::fs::remove_file(&old).unwrap();
    let new = h.add_file("new.mp4", b"video");
    let err = h.scanner.scan().await.unwrap_err();

    assert_matches!(err, ScanError::Store(_));
    assert!(h.record(&new).await.is_none());
    assert!(h.record(&old).await.is_some());
    assert_eq!(h.db.videos().count().await.unwrap(), 1);
    assert_eq!(h.tag_names().await, vec!["kept".to_string()]);
    assert!(h.artifact(&old).exists());
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    h.worker.stop().await;
}

#[tokio::test]
async fn test_invalid_config_aborts_pass() {
    let h = Harness::new().await;
    h.add_file("h.mp4", b"video");
    h.update_config(|c| c.thumbnails.fps = 0.0);

    let err = h.scanner.scan().await.unwrap_err();
    assert_matches!(err, ScanError::Config(_));
    assert_eq!(h.db.videos().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_fresh_artifact_is_not_regenerated() {
    let h = Harness::new().await;
    let video = h.add_file("i.mp4", b"video");
    let artifact = h.artifact(&video);
    std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
    std::fs::write(&artifact, b"GIF89a").unwrap();

    let summary = h.scanner.scan().await.unwrap();
    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);

    assert_eq!(summary.added, 1);
    assert_eq!(summary.thumbnails_queued, 0);
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
    h.worker.stop().await;
}

#[tokio::test]
async fn test_overlapping_roots_index_once() {
    let h = Harness::new().await;
    let video = h.add_file("Nested/j.avi", b"video");
    let roots = vec![h.library.clone(), h.library.join("Nested"), h.library.join(".")];
    h.update_config(|c| c.video_directories = roots);

    let summary = h.scanner.scan().await.unwrap();

    assert_eq!(summary.files_seen, 1);
    assert_eq!(summary.added, 1);
    let record = h.record(&video).await.unwrap();
    assert_eq!(record.tags, vec!["Nested".to_string()]);
    h.worker.stop().await;
}

#[tokio::test]
async fn test_scan_restarts_stopped_worker() {
    let h = Harness::new().await;
    let first = h.add_file("k.mp4", b"video");
    h.scanner.scan().await.unwrap();
    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);

    h.worker.stop().await;
    assert!(!h.worker.is_running());

    let second = h.add_file("l.mp4", b"video");
    let summary = h.scanner.scan().await.unwrap();
    assert!(h.worker.is_running());
    assert!(h.worker.wait_idle(IDLE_TIMEOUT).await);

    assert_eq!(summary.thumbnails_queued, 1);
    assert!(h.artifact(&first).exists());
    assert!(h.artifact(&second).exists());
    h.worker.stop().await;
}

#[tokio::test]
async fn test_progress_is_broadcast() {
    let h = Harness::new().await;
    h.add_file("m.mp4", b"video");
    h.add_file("n.mp4", b"video");
    let mut progress = h.scanner.subscribe();

    h.scanner.scan().await.unwrap();

    let mut last = None;
    while let Ok(event) = progress.try_recv() {
        last = Some(event);
    }
    let last = last.unwrap();
    assert!(last.is_complete);
    assert_eq!(last.files_seen, 2);
    assert_eq!(last.files_processed, 2);
    h.worker.stop().await;
}
