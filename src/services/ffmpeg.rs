//! FFmpeg-based media probing
//!
//! Uses ffprobe (command-line) to read the primary video stream of a file:
//! duration, frame count, frame rate and dimensions. ffprobe's JSON output is
//! stable, which makes it a better fit than linking FFmpeg directly.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::config::FfmpegConfig;

/// What the scanner and thumbnail generator need to know about a video
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProbe {
    /// Total duration in seconds
    pub duration_secs: f64,

    /// Number of frames in the primary video stream
    pub frame_count: u64,

    /// Frames per second of the primary video stream
    pub fps: f64,

    pub width: u32,
    pub height: u32,
}

/// FFprobe JSON output structures
mod ffprobe {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
        pub streams: Option<Vec<Stream>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub nb_frames: Option<String>,
        pub duration: Option<String>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        pub default: Option<i32>,
        pub attached_pic: Option<i32>,
    }
}

/// Source of video durations for the scanner
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Duration of the video in seconds
    async fn duration_secs(&self, path: &Path) -> Result<f64>;
}

/// FFmpeg service wrapping the ffprobe and ffmpeg executables
#[derive(Debug, Clone)]
pub struct FfmpegService {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegService {
    pub fn new(config: &FfmpegConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
        }
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.ffmpeg_path
    }

    /// Check if ffprobe is available
    pub async fn is_available(&self) -> bool {
        Command::new(&self.ffprobe_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Probe the primary video stream of a file
    pub async fn probe(&self, path: &Path) -> Result<VideoProbe> {
        debug!(path = %path.display(), "Probing video with ffprobe");

        if !path.exists() {
            bail!("ffprobe failed for '{}': file does not exist", path.display());
        }

        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error"])
            .args(["-print_format", "json"])
            .args(["-show_format", "-show_streams"])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute ffprobe for '{}'", path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            bail!(
                "ffprobe failed for '{}' (exit code {}): {}",
                path.display(),
                exit_code,
                if stderr.is_empty() {
                    "no error output"
                } else {
                    stderr.trim()
                }
            );
        }

        parse_probe_output(&output.stdout)
            .with_context(|| format!("Unusable ffprobe output for '{}'", path.display()))
    }
}

#[async_trait]
impl MediaProbe for FfmpegService {
    async fn duration_secs(&self, path: &Path) -> Result<f64> {
        Ok(self.probe(path).await?.duration_secs)
    }
}

/// Parse ffprobe's JSON into a `VideoProbe` for the primary video stream
pub fn parse_probe_output(json: &[u8]) -> Result<VideoProbe> {
    let probe: ffprobe::FfprobeOutput =
        serde_json::from_slice(json).context("Failed to parse ffprobe JSON output")?;

    let streams = probe.streams.unwrap_or_default();
    let video_streams: Vec<&ffprobe::Stream> = streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("video"))
        .filter(|s| s.disposition.as_ref().and_then(|d| d.attached_pic) != Some(1))
        .collect();
    let stream = video_streams
        .iter()
        .find(|s| s.disposition.as_ref().and_then(|d| d.default) == Some(1))
        .or_else(|| video_streams.first())
        .context("No video stream found")?;

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rational)
        .filter(|r| *r > 0.0)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rational))
        .unwrap_or(0.0);

    let duration = stream
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            probe
                .format
                .as_ref()
                .and_then(|f| f.duration.as_deref())
                .and_then(|d| d.parse::<f64>().ok())
        })
        .filter(|d| d.is_finite() && *d >= 0.0);

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .or_else(|| duration.map(|d| (d * fps).round() as u64))
        .unwrap_or(0);

    let duration_secs = match duration {
        Some(d) => d,
        None if fps > 0.0 => frame_count as f64 / fps,
        None => 0.0,
    };

    Ok(VideoProbe {
        duration_secs,
        frame_count,
        fps,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
    })
}

/// Parse an ffprobe rate such as "30000/1001" or "25"
fn parse_rational(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => s.trim().parse().ok(),
    }
}
