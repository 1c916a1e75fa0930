//! vidshelf - video library indexer
//!
//! Entry point for the scanner, the scheduled service mode, the read-only
//! listing commands and the internal `thumbnail` worker subcommand.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use vidshelf::cli::{CliOptions, Command, ThumbnailArgs, USAGE, VideoKey};
use vidshelf::config::{Config, LogFormat, ThumbnailConfig};
use vidshelf::db::{Database, VideoRecord};
use vidshelf::jobs::ScanSchedulerService;
use vidshelf::services::{
    FfmpegService, ScannerService, ServicesManager, ThumbnailGenerator, ThumbnailWorker,
    build_executor, init_tracing,
};

/// Upper bound on waiting for queued thumbnails after a one-shot scan
const SCAN_DRAIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let options = match CliOptions::from_args() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {e:#}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match options.command {
        Command::Help => {
            println!("{USAGE}");
            ExitCode::SUCCESS
        }
        Command::Thumbnail(args) => runtime.block_on(run_thumbnail(args)),
        command => match runtime.block_on(run(options.config_path, command)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %format!("{e:#}"), "vidshelf failed");
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Worker subprocess entry point: exit 0 when the artifact was written, 1 otherwise
async fn run_thumbnail(args: ThumbnailArgs) -> ExitCode {
    init_tracing(LogFormat::Pretty, true);

    let generator = ThumbnailGenerator::new(FfmpegService::new(&args.ffmpeg), args.settings);
    match generator.generate(&args.source, &args.dest).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(source = %args.source.display(), error = %e, "Thumbnail generation failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config_path: Option<std::path::PathBuf>, command: Command) -> Result<()> {
    let config_path = Config::resolve_path(config_path.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration '{}'", config_path.display()))?;

    init_tracing(config.log_format, false);
    info!(config = %config_path.display(), "Starting vidshelf");

    let db = Database::connect(&config.database.path).await?;

    if matches!(command, Command::Scan | Command::Serve)
        && !FfmpegService::new(&config.ffmpeg).is_available().await
    {
        warn!(
            ffprobe = %config.ffmpeg.ffprobe_path,
            "ffprobe not found; durations will be 0 and thumbnails will fail"
        );
    }

    let result = match command {
        Command::List { page, size } => list_videos(&db, page, size).await,
        Command::Search { tags, match_all } => search_videos(&db, &tags, match_all).await,
        Command::Show(key) => show_video(&db, &config.thumbnails, &key).await,
        Command::Tags => list_tags(&db).await,
        Command::Serve => serve(&db, config, config_path).await,
        _ => scan_once(&db, config, config_path).await,
    };

    db.close().await;
    result
}

fn build_scanner(
    db: &Database,
    config: Config,
    config_path: std::path::PathBuf,
) -> Result<Arc<ScannerService>> {
    let executor = build_executor(&config)?;
    let worker = Arc::new(ThumbnailWorker::new(config.thumbnails.clone(), executor));
    Ok(Arc::new(ScannerService::new(
        db.clone(),
        worker,
        Arc::new(config),
        Some(config_path),
    )))
}

/// One pass, then wait for its thumbnails
async fn scan_once(db: &Database, config: Config, config_path: std::path::PathBuf) -> Result<()> {
    let scanner = build_scanner(db, config, config_path)?;
    let worker = scanner.worker().clone();

    let outcome = scanner.scan().await;
    if outcome.is_ok() && !worker.wait_idle(SCAN_DRAIN_TIMEOUT).await {
        warn!("Timed out waiting for thumbnails");
    }
    worker.stop().await;

    let summary = outcome?;
    let stats = worker.stats();
    println!(
        "scanned {} files: {} added, {} updated, {} metadata changes, {} removed; thumbnails: {} generated, {} failed",
        summary.files_seen,
        summary.added,
        summary.updated,
        summary.metadata_changed,
        summary.removed,
        stats.succeeded,
        stats.failed,
    );
    Ok(())
}

/// Initial pass, then scheduled passes until interrupted
async fn serve(db: &Database, config: Config, config_path: std::path::PathBuf) -> Result<()> {
    let schedule = config.scan_schedule.clone();
    let scanner = build_scanner(db, config, config_path)?;

    let manager = ServicesManager::new();
    manager.register(scanner.worker().clone()).await;
    match schedule {
        Some(schedule) => {
            manager
                .register(Arc::new(ScanSchedulerService::new(scanner.clone(), schedule)))
                .await;
        }
        None => info!("No scan_schedule configured; scanning at startup only"),
    }
    manager.start_all().await?;

    if let Err(e) = scanner.scan().await {
        error!(error = %e, "Initial library scan failed");
    }
    for (name, health) in manager.health_all().await {
        info!(service = %name, status = ?health.status, message = ?health.message, "Service health");
    }

    shutdown_signal().await;

    manager.stop_all().await?;
    info!("vidshelf stopped");
    Ok(())
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received, stopping services");
}

async fn list_videos(db: &Database, page: u32, size: u32) -> Result<()> {
    let total = db.videos().count().await?;
    let videos = db.videos().list(page, size).await?;
    for video in &videos {
        print_video(video);
    }
    println!("page {} ({} of {} videos)", page, videos.len(), total);
    Ok(())
}

async fn search_videos(db: &Database, tags: &[String], match_all: bool) -> Result<()> {
    let videos = db.videos().search_by_tags(tags, match_all).await?;
    for video in &videos {
        print_video(video);
    }
    println!("{} matching videos", videos.len());
    Ok(())
}

async fn show_video(db: &Database, thumbnails: &ThumbnailConfig, key: &VideoKey) -> Result<()> {
    let video = match key {
        VideoKey::Id(id) => db.videos().get_by_id(*id).await?,
        VideoKey::ThumbnailId(thumbnail_id) => db.videos().get_by_thumbnail_id(thumbnail_id).await?,
    };
    let Some(video) = video else {
        match key {
            VideoKey::Id(id) => bail!("no video with id {}", id),
            VideoKey::ThumbnailId(thumbnail_id) => bail!("no video with thumbnail id '{}'", thumbnail_id),
        }
    };

    let artifact = thumbnails.artifact_path(&video.thumbnail_id);
    println!("id:        {}", video.id);
    println!("path:      {}", video.file_path);
    println!("duration:  {:.1}s", video.duration);
    println!("category:  {}", video.category.as_deref().unwrap_or("-"));
    println!("tags:      {}", video.tags.join(", "));
    println!("modified:  {}", video.file_modified_at.to_rfc3339());
    println!("indexed:   {}", video.created_at.to_rfc3339());
    println!(
        "thumbnail: {}{}",
        artifact.display(),
        if artifact.exists() { "" } else { " (missing)" }
    );
    Ok(())
}

async fn list_tags(db: &Database) -> Result<()> {
    for tag in db.tags().list().await? {
        println!("{}\t{}", tag.name, tag.video_count);
    }
    Ok(())
}

fn print_video(video: &VideoRecord) {
    println!(
        "{}\t{}\t{:.1}s\t{}\t[{}]\t{}",
        video.id,
        video.file_name,
        video.duration,
        video.category.as_deref().unwrap_or("-"),
        video.tags.join(", "),
        video.thumbnail_id,
    );
}
