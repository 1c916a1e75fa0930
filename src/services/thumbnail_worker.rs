//! Background thumbnail worker with bounded concurrency
//!
//! Requests go into an unbounded FIFO channel. A dispatch loop takes one
//! execution slot (semaphore permit), pulls the next task and spawns it on a
//! [`ThumbnailExecutor`]. A reap loop records each completion. A single
//! mutex-guarded [`TaskTable`] tracks what is queued, what is in flight and the
//! last terminal outcome per thumbnail id.
//!
//! `enqueue` never waits for generation. `stop` cancels queued work, gives
//! running generations a grace period, then aborts them. Aborting drops the
//! executor future, which kills any child process it spawned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, FfmpegConfig, Isolation, ThumbnailConfig};
use crate::services::ffmpeg::FfmpegService;
use crate::services::manager::{Service, ServiceHealth};
use crate::services::thumbnail::{ClipSettings, ThumbnailGenerator};

/// How often `stop` and `wait_idle` re-check the task table
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on waiting for the dispatch and reap loops to exit
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One unit of thumbnail work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailTask {
    pub thumbnail_id: String,
    pub source: PathBuf,
    pub dest: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    InFlight,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::InFlight)
    }
}

/// What `enqueue` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted for generation
    Queued,
    /// The artifact is at least as new as the source; nothing to do
    Fresh,
    /// The same id is already queued or running
    AlreadyPending,
    /// The worker is stopped
    NotRunning,
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub queued: usize,
    pub in_flight: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Runs a single thumbnail generation
#[async_trait]
pub trait ThumbnailExecutor: Send + Sync + 'static {
    async fn execute(&self, task: &ThumbnailTask, settings: &ClipSettings) -> Result<()>;
}

/// Runs each generation in a child process: `<program> thumbnail --source ... --dest ...`
pub struct ProcessExecutor {
    program: PathBuf,
    ffmpeg: FfmpegConfig,
}

impl ProcessExecutor {
    /// Re-invoke the current executable
    pub fn current_exe(ffmpeg: FfmpegConfig) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(Self::with_program(program, ffmpeg))
    }

    pub fn with_program(program: PathBuf, ffmpeg: FfmpegConfig) -> Self {
        Self { program, ffmpeg }
    }
}

#[async_trait]
impl ThumbnailExecutor for ProcessExecutor {
    async fn execute(&self, task: &ThumbnailTask, settings: &ClipSettings) -> Result<()> {
        let output = Command::new(&self.program)
            .arg("thumbnail")
            .arg("--source")
            .arg(&task.source)
            .arg("--dest")
            .arg(&task.dest)
            .args(["--duration", &settings.clip_duration.to_string()])
            .args(["--fps", &settings.fps.to_string()])
            .args(["--max-size", &settings.max_size.to_string()])
            .args(["--ffmpeg", &self.ffmpeg.ffmpeg_path])
            .args(["--ffprobe", &self.ffmpeg.ffprobe_path])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn '{}'", self.program.display()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            if !stderr.trim().is_empty() {
                debug!(thumbnail_id = %task.thumbnail_id, output = %stderr.trim(), "Thumbnail process output");
            }
            Ok(())
        } else {
            bail!(
                "thumbnail process exited with {}: {}",
                output.status,
                if stderr.trim().is_empty() {
                    "no error output"
                } else {
                    stderr.trim()
                }
            )
        }
    }
}

/// Runs the generator inside this process
pub struct InProcessExecutor {
    ffmpeg: FfmpegService,
}

impl InProcessExecutor {
    pub fn new(ffmpeg: FfmpegService) -> Self {
        Self { ffmpeg }
    }
}

#[async_trait]
impl ThumbnailExecutor for InProcessExecutor {
    async fn execute(&self, task: &ThumbnailTask, settings: &ClipSettings) -> Result<()> {
        ThumbnailGenerator::new(self.ffmpeg.clone(), *settings)
            .generate(&task.source, &task.dest)
            .await?;
        Ok(())
    }
}

/// Pick the executor named by `thumbnails.isolation`
pub fn build_executor(config: &Config) -> Result<Arc<dyn ThumbnailExecutor>> {
    Ok(match config.thumbnails.isolation {
        Isolation::Process => Arc::new(ProcessExecutor::current_exe(config.ffmpeg.clone())?),
        Isolation::InProcess => Arc::new(InProcessExecutor::new(FfmpegService::new(&config.ffmpeg))),
    })
}

/// Whether `artifact` exists and is not older than `source`
fn artifact_is_fresh(artifact: &Path, source: &Path) -> bool {
    let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified());
    match (modified(artifact), modified(source)) {
        (Ok(artifact), Ok(source)) => artifact >= source,
        _ => false,
    }
}

struct InFlightTask {
    abort: AbortHandle,
    source: PathBuf,
    started: Instant,
}

#[derive(Default)]
struct TaskTable {
    states: HashMap<String, TaskState>,
    in_flight: HashMap<String, InFlightTask>,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
}

impl TaskTable {
    fn queued(&self) -> usize {
        self.states.values().filter(|s| **s == TaskState::Queued).count()
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && !self.states.values().any(|s| *s == TaskState::Queued)
    }

    fn cancel_queued(&mut self) -> usize {
        let mut count = 0;
        for state in self.states.values_mut() {
            if *state == TaskState::Queued {
                *state = TaskState::Cancelled;
                count += 1;
            }
        }
        self.cancelled += count as u64;
        count
    }
}

struct Completion {
    thumbnail_id: String,
    result: Result<()>,
}

struct WorkerInner {
    table: Mutex<TaskTable>,
    settings: RwLock<ThumbnailConfig>,
    executor: Arc<dyn ThumbnailExecutor>,
}

impl WorkerInner {
    /// Spawn `task` and record it as in flight
    fn launch(&self, task: ThumbnailTask, permit: OwnedSemaphorePermit, done: mpsc::UnboundedSender<Completion>) {
        let settings = ClipSettings::from(&*self.settings.read());
        let executor = self.executor.clone();

        let mut table = self.table.lock();
        if table.states.get(&task.thumbnail_id) != Some(&TaskState::Queued) {
            return;
        }

        let id = task.thumbnail_id.clone();
        let source = task.source.clone();
        // Spawned under the table lock so the completion cannot be reaped before it is recorded
        let handle = tokio::spawn(async move {
            let _permit = permit;
            debug!(thumbnail_id = %task.thumbnail_id, source = %task.source.display(), "Generating thumbnail");
            let result = executor.execute(&task, &settings).await;
            let _ = done.send(Completion {
                thumbnail_id: task.thumbnail_id,
                result,
            });
        });

        table.states.insert(id.clone(), TaskState::InFlight);
        table.in_flight.insert(
            id,
            InFlightTask {
                abort: handle.abort_handle(),
                source,
                started: Instant::now(),
            },
        );
    }

    fn finish(&self, completion: Completion) {
        let entry = {
            let mut table = self.table.lock();
            let Some(entry) = table.in_flight.remove(&completion.thumbnail_id) else {
                // Already cancelled by stop
                return;
            };
            let state = if completion.result.is_ok() {
                table.succeeded += 1;
                TaskState::Succeeded
            } else {
                table.failed += 1;
                TaskState::Failed
            };
            table.states.insert(completion.thumbnail_id.clone(), state);
            entry
        };

        let elapsed_ms = entry.started.elapsed().as_millis() as u64;
        match completion.result {
            Ok(()) => info!(
                thumbnail_id = %completion.thumbnail_id,
                source = %entry.source.display(),
                elapsed_ms,
                "Thumbnail generated"
            ),
            Err(e) => warn!(
                thumbnail_id = %completion.thumbnail_id,
                source = %entry.source.display(),
                elapsed_ms,
                error = %format!("{e:#}"),
                "Thumbnail generation failed"
            ),
        }
    }
}

async fn dispatch_loop(
    inner: Arc<WorkerInner>,
    mut rx: mpsc::UnboundedReceiver<ThumbnailTask>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    done: mpsc::UnboundedSender<Completion>,
) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        inner.launch(task, permit, done.clone());
    }
    debug!("Thumbnail dispatch loop exited");
}

async fn reap_loop(inner: Arc<WorkerInner>, mut done: mpsc::UnboundedReceiver<Completion>) {
    // Ends once the dispatch loop and every spawned task have dropped their senders
    while let Some(completion) = done.recv().await {
        inner.finish(completion);
    }
    debug!("Thumbnail reap loop exited");
}

struct Runtime {
    cancel: CancellationToken,
    dispatch: JoinHandle<()>,
    reap: JoinHandle<()>,
}

/// Bounded background generator of thumbnail artifacts
pub struct ThumbnailWorker {
    inner: Arc<WorkerInner>,
    sender: Mutex<Option<mpsc::UnboundedSender<ThumbnailTask>>>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

impl ThumbnailWorker {
    pub fn new(settings: ThumbnailConfig, executor: Arc<dyn ThumbnailExecutor>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                table: Mutex::new(TaskTable::default()),
                settings: RwLock::new(settings),
                executor,
            }),
            sender: Mutex::new(None),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the thumbnail settings.
    ///
    /// Clip settings and artifact location apply to the next dispatched task;
    /// `max_workers` applies from the next `start`.
    pub fn update_settings(&self, settings: &ThumbnailConfig) {
        *self.inner.settings.write() = settings.clone();
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Start the dispatch and reap loops. No-op when already running.
    pub async fn start(&self) {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return;
        }

        let max_workers = self.inner.settings.read().max_workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let slots = Arc::new(Semaphore::new(max_workers));

        let dispatch = tokio::spawn(dispatch_loop(
            self.inner.clone(),
            rx,
            slots,
            cancel.clone(),
            done_tx,
        ));
        let reap = tokio::spawn(reap_loop(self.inner.clone(), done_rx));

        *self.sender.lock() = Some(tx);
        *runtime = Some(Runtime {
            cancel,
            dispatch,
            reap,
        });
        info!(max_workers, "Thumbnail worker started");
    }

    /// Request generation of the thumbnail for `source`
    pub fn enqueue(&self, thumbnail_id: &str, source: &Path) -> EnqueueOutcome {
        let dest = self.inner.settings.read().artifact_path(thumbnail_id);
        if artifact_is_fresh(&dest, source) {
            debug!(thumbnail_id, "Thumbnail is up to date");
            return EnqueueOutcome::Fresh;
        }

        let Some(sender) = self.sender.lock().clone() else {
            warn!(thumbnail_id, "Thumbnail worker is not running, request dropped");
            return EnqueueOutcome::NotRunning;
        };

        let mut table = self.inner.table.lock();
        let previous = table.states.get(thumbnail_id).copied();
        if previous.is_some_and(TaskState::is_pending) {
            return EnqueueOutcome::AlreadyPending;
        }
        table.states.insert(thumbnail_id.to_string(), TaskState::Queued);

        let task = ThumbnailTask {
            thumbnail_id: thumbnail_id.to_string(),
            source: source.to_path_buf(),
            dest,
        };
        if sender.send(task).is_err() {
            match previous {
                Some(state) => table.states.insert(thumbnail_id.to_string(), state),
                None => table.states.remove(thumbnail_id),
            };
            warn!(thumbnail_id, "Thumbnail worker is shutting down, request dropped");
            return EnqueueOutcome::NotRunning;
        }

        debug!(thumbnail_id, source = %source.display(), "Thumbnail queued");
        EnqueueOutcome::Queued
    }

    /// Cancel a queued or running generation. Returns false when nothing was pending.
    pub fn cancel(&self, thumbnail_id: &str) -> bool {
        let mut table = self.inner.table.lock();
        if let Some(task) = table.in_flight.remove(thumbnail_id) {
            task.abort.abort();
            warn!(thumbnail_id, source = %task.source.display(), "Aborted running thumbnail generation");
        } else if table.states.get(thumbnail_id) != Some(&TaskState::Queued) {
            return false;
        }
        table.states.insert(thumbnail_id.to_string(), TaskState::Cancelled);
        table.cancelled += 1;
        debug!(thumbnail_id, "Thumbnail cancelled");
        true
    }

    /// Last terminal outcome: `Some(true)` succeeded, `Some(false)` failed or
    /// cancelled, `None` when unknown or still pending
    pub fn result_of(&self, thumbnail_id: &str) -> Option<bool> {
        match self.status_of(thumbnail_id)? {
            TaskState::Succeeded => Some(true),
            TaskState::Failed | TaskState::Cancelled => Some(false),
            TaskState::Queued | TaskState::InFlight => None,
        }
    }

    pub fn status_of(&self, thumbnail_id: &str) -> Option<TaskState> {
        self.inner.table.lock().states.get(thumbnail_id).copied()
    }

    pub fn stats(&self) -> WorkerStats {
        let table = self.inner.table.lock();
        WorkerStats {
            queued: table.queued(),
            in_flight: table.in_flight.len(),
            succeeded: table.succeeded,
            failed: table.failed,
            cancelled: table.cancelled,
        }
    }

    /// Wait until nothing is queued or in flight. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.table.lock().is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop the worker. Queued tasks are cancelled; running ones get the
    /// configured grace period, then are aborted. No-op when stopped.
    pub async fn stop(&self) {
        let mut runtime = self.runtime.lock().await;
        let Some(mut rt) = runtime.take() else {
            return;
        };
        self.sender.lock().take();
        rt.cancel.cancel();

        if tokio::time::timeout(JOIN_TIMEOUT, &mut rt.dispatch).await.is_err() {
            warn!("Thumbnail dispatch loop did not exit in time, aborting");
            rt.dispatch.abort();
        }

        let dropped = self.inner.table.lock().cancel_queued();
        if dropped > 0 {
            info!(count = dropped, "Cancelled queued thumbnails");
        }

        let grace = self.inner.settings.read().shutdown_grace();
        let deadline = Instant::now() + grace;
        while !self.inner.table.lock().in_flight.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let aborted: Vec<(String, InFlightTask)> = {
            let mut table = self.inner.table.lock();
            let aborted: Vec<_> = table.in_flight.drain().collect();
            for (id, _) in &aborted {
                table.states.insert(id.clone(), TaskState::Cancelled);
            }
            table.cancelled += aborted.len() as u64;
            aborted
        };
        for (id, task) in &aborted {
            task.abort.abort();
            warn!(thumbnail_id = %id, source = %task.source.display(), "Aborted running thumbnail generation");
        }

        if tokio::time::timeout(JOIN_TIMEOUT, &mut rt.reap).await.is_err() {
            warn!("Thumbnail reap loop did not exit in time, aborting");
            rt.reap.abort();
        }

        info!("Thumbnail worker stopped");
    }
}

#[async_trait]
impl Service for ThumbnailWorker {
    fn name(&self) -> &str {
        "thumbnail_worker"
    }

    async fn start(&self) -> Result<()> {
        ThumbnailWorker::start(self).await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        ThumbnailWorker::stop(self).await;
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        if !self.is_running() {
            return Ok(ServiceHealth::unhealthy("Thumbnail worker is stopped"));
        }
        let stats = self.stats();
        if stats.failed > 0 {
            return Ok(ServiceHealth::degraded(format!(
                "{} thumbnail(s) failed",
                stats.failed
            )));
        }
        Ok(ServiceHealth::healthy())
    }
}
