//! Library scanner service
//!
//! A scan walks every configured root, reconciles what it finds against the
//! record store inside one transaction, and only after a successful commit
//! deletes stale artifacts and hands thumbnail work to the worker. Passes are
//! serialized by an async mutex.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::db::sqlite_helpers::system_time_to_datetime;
use crate::db::{Database, NewVideo, RecordStore, VideoRecord, VideoUpdate};
use crate::services::ffmpeg::{FfmpegService, MediaProbe};
use crate::services::metadata::{VideoMetadata, read_video_metadata};
use crate::services::paths;
use crate::services::thumbnail::thumbnail_id;
use crate::services::thumbnail_worker::{EnqueueOutcome, ThumbnailWorker};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to reload configuration: {0:#}")]
    Config(anyhow::Error),

    #[error("library root '{path}' is unavailable: {source}")]
    RootUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to walk library root '{root}': {source}")]
    Walk {
        root: PathBuf,
        source: walkdir::Error,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Scanner progress event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanProgress {
    pub files_seen: usize,
    pub files_processed: usize,
    pub current_file: Option<String>,
    pub is_complete: bool,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub files_seen: usize,
    pub added: usize,
    /// Records refreshed because the source file changed
    pub updated: usize,
    /// Records whose category or tags changed without the file changing
    pub metadata_changed: usize,
    pub removed: usize,
    pub tags_removed: u64,
    pub thumbnails_queued: usize,
}

/// Work deferred until after commit
#[derive(Default)]
struct PassOutcome {
    summary: ScanSummary,
    thumbnails: Vec<(String, PathBuf)>,
    /// Thumbnail id and artifact path of every removed record
    stale_artifacts: Vec<(String, PathBuf)>,
}

/// Scanner service reconciling library roots with the database
pub struct ScannerService {
    db: Database,
    worker: Arc<ThumbnailWorker>,
    probe: Arc<dyn MediaProbe>,
    config: RwLock<Arc<Config>>,
    config_path: Option<PathBuf>,
    scan_lock: Mutex<()>,
    progress_tx: broadcast::Sender<ScanProgress>,
}

impl ScannerService {
    /// Create a scanner. With `config_path` set, configuration is re-read at the start of every pass.
    pub fn new(
        db: Database,
        worker: Arc<ThumbnailWorker>,
        config: Arc<Config>,
        config_path: Option<PathBuf>,
    ) -> Self {
        let probe = Arc::new(FfmpegService::new(&config.ffmpeg));
        Self::with_probe(db, worker, config, config_path, probe)
    }

    pub fn with_probe(
        db: Database,
        worker: Arc<ThumbnailWorker>,
        config: Arc<Config>,
        config_path: Option<PathBuf>,
        probe: Arc<dyn MediaProbe>,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(100);
        Self {
            db,
            worker,
            probe,
            config: RwLock::new(config),
            config_path,
            scan_lock: Mutex::new(()),
            progress_tx,
        }
    }

    /// Subscribe to scan progress updates
    pub fn subscribe(&self) -> broadcast::Receiver<ScanProgress> {
        self.progress_tx.subscribe()
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn worker(&self) -> &Arc<ThumbnailWorker> {
        &self.worker
    }

    /// Run one reconciliation pass
    pub async fn scan(&self) -> Result<ScanSummary, ScanError> {
        let _pass = self.scan_lock.lock().await;

        let config = self.reload_config()?;
        self.worker.update_settings(&config.thumbnails);
        self.worker.start().await;

        info!(roots = ?config.video_directories, "Starting library scan");

        let mut store = self.db.begin_scan().await?;
        let outcome = match self.reconcile(&mut store, &config).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Library scan failed, rolling back");
                if let Err(rb) = store.rollback().await {
                    warn!(error = %rb, "Rollback failed");
                }
                return Err(e);
            }
        };
        if let Err(e) = store.commit().await {
            error!(error = %e, "Failed to commit library scan");
            return Err(e.into());
        }

        let mut summary = outcome.summary;
        for (id, artifact) in &outcome.stale_artifacts {
            // A pending generation would recreate the artifact after it is removed
            self.worker.cancel(id);
            match std::fs::remove_file(artifact) {
                Ok(()) => debug!(path = %artifact.display(), "Removed stale thumbnail"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %artifact.display(), error = %e, "Failed to remove stale thumbnail"),
            }
        }
        for (id, path) in &outcome.thumbnails {
            if self.worker.enqueue(id, path) == EnqueueOutcome::Queued {
                summary.thumbnails_queued += 1;
            }
        }

        let _ = self.progress_tx.send(ScanProgress {
            files_seen: summary.files_seen,
            files_processed: summary.files_seen,
            current_file: None,
            is_complete: true,
        });

        info!(
            files = summary.files_seen,
            added = summary.added,
            updated = summary.updated,
            metadata_changed = summary.metadata_changed,
            removed = summary.removed,
            tags_removed = summary.tags_removed,
            thumbnails_queued = summary.thumbnails_queued,
            "Library scan complete"
        );
        Ok(summary)
    }

    fn reload_config(&self) -> Result<Arc<Config>, ScanError> {
        if let Some(path) = &self.config_path {
            let fresh = Arc::new(Config::load(path).map_err(ScanError::Config)?);
            *self.config.write() = fresh;
        }
        Ok(self.config())
    }

    /// Walk, diff and write. Nothing here touches the artifact store or the worker.
    async fn reconcile(
        &self,
        store: &mut dyn RecordStore,
        config: &Config,
    ) -> Result<PassOutcome, ScanError> {
        let roots = unique_roots(&config.video_directories);
        let files = walk_roots(&roots, config)?;
        let seen: HashSet<&Path> = files.iter().map(|(path, _)| path.as_path()).collect();

        let mut outcome = PassOutcome::default();
        outcome.summary.files_seen = files.len();

        for (index, (path, root)) in files.iter().enumerate() {
            let path_str = path.to_string_lossy().into_owned();
            let _ = self.progress_tx.send(ScanProgress {
                files_seen: files.len(),
                files_processed: index,
                current_file: Some(path_str.clone()),
                is_complete: false,
            });

            let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(t) => system_time_to_datetime(t),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat video, skipping");
                    continue;
                }
            };
            let metadata = read_video_metadata(path, root);
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path_str.clone());
            let id = thumbnail_id(&path_str);

            match store.find_by_path(&path_str).await? {
                None => {
                    let duration = self.probe_duration(path).await.unwrap_or(0.0);
                    let record = store
                        .insert(&NewVideo {
                            file_path: path_str.clone(),
                            file_name,
                            thumbnail_id: id.clone(),
                            duration,
                            file_modified_at: modified,
                        })
                        .await?;
                    sync_metadata(store, &record, &metadata).await?;
                    debug!(path = %path_str, "Added video");
                    outcome.summary.added += 1;
                }
                Some(record) if modified > record.file_modified_at => {
                    let duration = self
                        .probe_duration(path)
                        .await
                        .unwrap_or(record.duration);
                    store
                        .update(
                            record.id,
                            &VideoUpdate {
                                file_name,
                                thumbnail_id: id.clone(),
                                duration,
                                file_modified_at: modified,
                            },
                        )
                        .await?;
                    sync_metadata(store, &record, &metadata).await?;
                    debug!(path = %path_str, "Updated modified video");
                    outcome.summary.updated += 1;
                }
                Some(record) => {
                    if sync_metadata(store, &record, &metadata).await? {
                        outcome.summary.metadata_changed += 1;
                    }
                }
            }
            outcome.thumbnails.push((id, path.clone()));
        }

        for record in store.list_all().await? {
            let path = PathBuf::from(&record.file_path);
            if seen.contains(path.as_path()) && paths::is_within_roots(&path, &roots) {
                continue;
            }
            store.delete(record.id).await?;
            debug!(path = %record.file_path, "Removed missing video");
            let artifact = config.thumbnails.artifact_path(&record.thumbnail_id);
            outcome.stale_artifacts.push((record.thumbnail_id, artifact));
            outcome.summary.removed += 1;
        }

        outcome.summary.tags_removed = store.delete_unused_tags().await?;
        Ok(outcome)
    }

    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        match self.probe.duration_secs(path).await {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{e:#}"), "Failed to read video duration");
                None
            }
        }
    }
}

/// Normalized roots with duplicates removed, in configured order
fn unique_roots(configured: &[PathBuf]) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::with_capacity(configured.len());
    for root in configured {
        let root = paths::normalize(root);
        if !roots.contains(&root) {
            roots.push(root);
        }
    }
    roots
}

/// Every video file under `roots` with the root it was found under.
/// A file reachable from two overlapping roots is reported once, for the first root.
/// Paths that are not valid UTF-8 cannot be stored as record keys and are skipped.
fn walk_roots(roots: &[PathBuf], config: &Config) -> Result<Vec<(PathBuf, PathBuf)>, ScanError> {
    let mut files = Vec::new();
    let mut seen = HashSet::new();

    for root in roots {
        let meta = std::fs::metadata(root).map_err(|source| ScanError::RootUnavailable {
            path: root.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ScanError::RootUnavailable {
                path: root.clone(),
                source: std::io::Error::other("not a directory"),
            });
        }

        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(|source| ScanError::Walk {
                root: root.clone(),
                source,
            })?;
            if !entry.file_type().is_file() || !config.is_video_file(entry.path()) {
                continue;
            }
            let path = paths::normalize(entry.path());
            if path.to_str().is_none() {
                warn!(path = %path.display(), "Skipping video with a non UTF-8 path");
                continue;
            }
            if seen.insert(path.clone()) {
                files.push((path, root.clone()));
            }
        }
    }
    Ok(files)
}

/// Bring a record's category and tags in line with its metadata. Returns whether anything was written.
///
/// A stored category is only replaced, never cleared: metadata without a
/// category (no `!` line, or an unreadable sidecar) leaves it as it is.
async fn sync_metadata(
    store: &mut dyn RecordStore,
    record: &VideoRecord,
    metadata: &VideoMetadata,
) -> anyhow::Result<bool> {
    let mut changed = false;

    if let Some(category) = metadata.category.as_deref() {
        if record.category.as_deref() != Some(category) {
            store.set_category(record.id, Some(category)).await?;
            changed = true;
        }
    }

    let mut wanted = metadata.tags.clone();
    wanted.sort();
    if record.tags != wanted {
        store.replace_tags(record.id, &metadata.tags).await?;
        changed = true;
    }

    Ok(changed)
}
