//! Library services

pub mod ffmpeg;
pub mod logging;
pub mod manager;
pub mod metadata;
pub mod paths;
pub mod scanner;
pub mod thumbnail;
pub mod thumbnail_worker;

pub use ffmpeg::{FfmpegService, MediaProbe, VideoProbe};
pub use logging::init_tracing;
pub use manager::{HealthStatus, Service, ServiceHealth, ServicesManager};
pub use metadata::{VideoMetadata, read_video_metadata};
pub use scanner::{ScanError, ScanProgress, ScanSummary, ScannerService};
pub use thumbnail::{ClipSettings, ThumbnailError, ThumbnailGenerator, thumbnail_id};
pub use thumbnail_worker::{
    EnqueueOutcome, InProcessExecutor, ProcessExecutor, TaskState, ThumbnailExecutor,
    ThumbnailTask, ThumbnailWorker, WorkerStats, build_executor,
};
