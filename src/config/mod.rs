//! Application configuration management
//!
//! Configuration lives in a YAML file (default `./config/config.yaml`). A default
//! file is written on first run. A handful of environment variables override the
//! file so deployments can redirect the database or thumbnail store without
//! editing it.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "VIDSHELF_CONFIG";

/// Default location of the config file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "./config/config.yaml";

/// Application configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root directories to scan, in priority order
    pub video_directories: Vec<PathBuf>,

    /// Recognized video extensions (without the dot, compared case-insensitively)
    pub video_extensions: Vec<String>,

    pub database: DatabaseConfig,

    pub thumbnails: ThumbnailConfig,

    pub ffmpeg: FfmpegConfig,

    /// Cron expression (seconds field first) for periodic rescans in `serve` mode
    pub scan_schedule: Option<String>,

    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
}

/// Thumbnail store and generation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Directory holding one artifact per thumbnail id
    pub directory: PathBuf,

    /// Artifact file extension. The artifact is always an animated GIF.
    pub extension: String,

    /// Clip length in seconds
    pub duration: f64,

    /// Output frame rate
    pub fps: f64,

    /// Maximum width or height of the output, in pixels
    pub max_size: u32,

    /// Number of parallel execution slots
    pub max_workers: usize,

    /// Where each generation runs
    pub isolation: Isolation,

    /// How long running generations may finish during shutdown before being killed
    pub shutdown_grace_ms: u64,
}

/// Execution context for a single thumbnail generation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Separate OS process per generation (re-invokes this binary)
    Process,
    /// Tokio blocking pool inside the current process
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FfmpegConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for Config {
    fn default() -> Self {
        let base = dirs::video_dir().unwrap_or_else(|| PathBuf::from("./videos"));
        Self {
            video_directories: vec![base],
            video_extensions: ["mp4", "avi", "mkv", "mov"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            database: DatabaseConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            ffmpeg: FfmpegConfig::default(),
            scan_schedule: None,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("vidshelf.db"),
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            directory: data_dir().join("thumbnails"),
            extension: "gif".to_string(),
            duration: 3.0,
            fps: 5.0,
            max_size: 480,
            max_workers: 4,
            isolation: Isolation::Process,
            shutdown_grace_ms: 2000,
        }
    }
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Pretty
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("vidshelf"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl Config {
    /// Resolve the config file path from an explicit argument, the environment, or the default
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from a YAML file, writing a default one if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            Self::write_default(path)?;
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid config file '{}'", path.display()))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory '{}'", parent.display())
            })?;
        }
        let yaml = serde_yaml::to_string(&Config::default())?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write default config '{}'", path.display()))?;
        info!(path = %path.display(), "Wrote default configuration");
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(path) = env::var("VIDSHELF_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(dir) = env::var("VIDSHELF_THUMBNAIL_DIR") {
            self.thumbnails.directory = PathBuf::from(dir);
        }
        if let Ok(workers) = env::var("VIDSHELF_MAX_WORKERS") {
            self.thumbnails.max_workers = workers
                .parse()
                .context("Invalid VIDSHELF_MAX_WORKERS")?;
        }
        if let Ok(ffmpeg) = env::var("VIDSHELF_FFMPEG") {
            self.ffmpeg.ffmpeg_path = ffmpeg;
        }
        if let Ok(ffprobe) = env::var("VIDSHELF_FFPROBE") {
            self.ffmpeg.ffprobe_path = ffprobe;
        }
        Ok(())
    }

    /// Reject values the thumbnail pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        let t = &self.thumbnails;
        if !(t.duration > 0.0) {
            bail!("thumbnails.duration must be positive (got {})", t.duration);
        }
        if !(t.fps > 0.0) {
            bail!("thumbnails.fps must be positive (got {})", t.fps);
        }
        if Duration::try_from_secs_f64(1.0 / t.fps).is_err() {
            bail!("thumbnails.fps is too small (got {})", t.fps);
        }
        if t.max_size == 0 {
            bail!("thumbnails.max_size must be positive");
        }
        if t.max_workers == 0 {
            bail!("thumbnails.max_workers must be positive");
        }
        Ok(())
    }

    /// Whether a file name carries one of the recognized video extensions
    pub fn is_video_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.video_extensions
                    .iter()
                    .any(|known| known.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

impl ThumbnailConfig {
    /// Artifact path for a thumbnail id
    pub fn artifact_path(&self, thumbnail_id: &str) -> PathBuf {
        let ext = self.extension.trim_start_matches('.');
        self.directory.join(format!("{thumbnail_id}.{ext}"))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
