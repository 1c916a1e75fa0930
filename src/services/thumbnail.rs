//! Animated thumbnail generation
//!
//! A thumbnail is a short looping GIF cut from the middle of the video:
//!
//! 1. ffprobe reports frame count and frame rate
//! 2. [`plan_clip`] picks a window of frames around the midpoint
//! 3. ffmpeg decodes every `step`-th frame of that window to raw RGB on stdout
//! 4. each frame is shrunk to fit `max_size` as soon as it is read
//! 5. the frames are encoded as a GIF into `<dest>.tmp`, then renamed into place

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::FilterType;
use image::{Delay, DynamicImage, Frame, RgbImage, RgbaImage};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ThumbnailConfig;
use crate::services::ffmpeg::FfmpegService;

/// Stable thumbnail identifier for a video path
pub fn thumbnail_id(path: &str) -> String {
    let hash = format!("{:x}", Sha256::digest(path.as_bytes()));
    hash[..32].to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    #[error("failed to probe '{path}': {message}")]
    Probe { path: PathBuf, message: String },

    #[error("'{path}' has no usable video stream (frames: {frame_count}, fps: {fps})")]
    InvalidStream {
        path: PathBuf,
        frame_count: u64,
        fps: f64,
    },

    #[error("ffmpeg failed to decode '{path}': {message}")]
    Decode { path: PathBuf, message: String },

    #[error("frame rate {0} does not give a representable frame delay")]
    InvalidFps(f64),

    #[error("no frames decoded from '{0}'")]
    NoFrames(PathBuf),

    #[error("failed to encode animation: {0}")]
    Encode(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shape of the generated clip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipSettings {
    /// Clip length in seconds
    pub clip_duration: f64,
    /// Output frames per second
    pub fps: f64,
    /// Largest allowed width or height
    pub max_size: u32,
}

impl From<&ThumbnailConfig> for ClipSettings {
    fn from(config: &ThumbnailConfig) -> Self {
        Self {
            clip_duration: config.duration,
            fps: config.fps,
            max_size: config.max_size,
        }
    }
}

/// Which source frames end up in the clip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipPlan {
    /// First source frame to consider
    pub start_frame: u64,
    /// Take every `step`-th frame from `start_frame`
    pub step: u64,
    /// Number of frames in the output
    pub target_frames: u64,
}

/// Center a clip of `settings.clip_duration` seconds on the middle frame
pub fn plan_clip(settings: &ClipSettings, frame_count: u64, source_fps: f64) -> ClipPlan {
    let target_frames = ((settings.clip_duration * settings.fps).round() as u64).max(1);
    let span = settings.clip_duration * source_fps;
    let step = ((span / target_frames as f64).floor() as u64).max(1);
    let midpoint = frame_count / 2;
    let start_frame = midpoint.saturating_sub(target_frames * step / 2);

    ClipPlan {
        start_frame,
        step,
        target_frames,
    }
}

/// Scale `(width, height)` down to fit in a `max_size` square, keeping aspect ratio
pub fn fit_within(width: u32, height: u32, max_size: u32) -> (u32, u32) {
    if width <= max_size && height <= max_size {
        return (width, height);
    }
    let scale = f64::from(max_size) / f64::from(width.max(height));
    let w = ((f64::from(width) * scale).round() as u32).clamp(1, max_size);
    let h = ((f64::from(height) * scale).round() as u32).clamp(1, max_size);
    (w, h)
}

fn shrink_frame(frame: RgbImage, max_size: u32) -> RgbaImage {
    let (w, h) = fit_within(frame.width(), frame.height(), max_size);
    let frame = if (w, h) == frame.dimensions() {
        frame
    } else {
        image::imageops::resize(&frame, w, h, FilterType::Triangle)
    };
    DynamicImage::ImageRgb8(frame).into_rgba8()
}

/// Encode `frames` as an infinitely looping GIF at `dest`.
///
/// The file is written to `<dest>.tmp` and renamed, so `dest` either keeps its
/// previous content or holds the complete new animation.
pub fn write_animation(frames: Vec<RgbaImage>, dest: &Path, fps: f64) -> Result<(), ThumbnailError> {
    let frame_time = Duration::try_from_secs_f64(1.0 / fps).map_err(|_| ThumbnailError::InvalidFps(fps))?;
    let delay = Delay::from_saturating_duration(frame_time);

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new_with_speed(&mut bytes, 10);
        encoder.set_repeat(Repeat::Infinite)?;
        encoder.encode_frames(
            frames
                .into_iter()
                .map(|buffer| Frame::from_parts(buffer, 0, 0, delay)),
        )?;
    }

    let mut tmp = OsString::from(dest.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let written = std::fs::write(&tmp, &bytes).and_then(|()| std::fs::rename(&tmp, dest));
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Produces one animated thumbnail per call
#[derive(Debug, Clone)]
pub struct ThumbnailGenerator {
    ffmpeg: FfmpegService,
    settings: ClipSettings,
}

impl ThumbnailGenerator {
    pub fn new(ffmpeg: FfmpegService, settings: ClipSettings) -> Self {
        Self { ffmpeg, settings }
    }

    /// Generate the animated thumbnail for `source` at `dest`
    pub async fn generate(&self, source: &Path, dest: &Path) -> Result<(), ThumbnailError> {
        let probe = self
            .ffmpeg
            .probe(source)
            .await
            .map_err(|e| ThumbnailError::Probe {
                path: source.to_path_buf(),
                message: format!("{e:#}"),
            })?;

        if probe.frame_count == 0 || !(probe.fps > 0.0) || probe.width == 0 || probe.height == 0 {
            return Err(ThumbnailError::InvalidStream {
                path: source.to_path_buf(),
                frame_count: probe.frame_count,
                fps: probe.fps,
            });
        }

        let plan = plan_clip(&self.settings, probe.frame_count, probe.fps);
        debug!(
            path = %source.display(),
            start_frame = plan.start_frame,
            step = plan.step,
            target_frames = plan.target_frames,
            "Planned thumbnail clip"
        );

        let frames = self
            .decode_frames(source, probe.width, probe.height, probe.fps, &plan)
            .await?;
        if frames.is_empty() {
            return Err(ThumbnailError::NoFrames(source.to_path_buf()));
        }

        let dest = dest.to_path_buf();
        let fps = self.settings.fps;
        tokio::task::spawn_blocking(move || write_animation(frames, &dest, fps))
            .await
            .map_err(std::io::Error::other)?
    }

    async fn decode_frames(
        &self,
        source: &Path,
        width: u32,
        height: u32,
        source_fps: f64,
        plan: &ClipPlan,
    ) -> Result<Vec<RgbaImage>, ThumbnailError> {
        let start_secs = plan.start_frame as f64 / source_fps;

        let mut child = Command::new(self.ffmpeg.ffmpeg_path())
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(["-ss", &format!("{start_secs:.3}")])
            .arg("-noautorotate")
            .arg("-i")
            .arg(source)
            .args(["-an", "-sn", "-dn"])
            .args(["-vf", &format!("select=not(mod(n\\,{}))", plan.step)])
            .args(["-fps_mode", "passthrough"])
            .args(["-frames:v", &plan.target_frames.to_string()])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("ffmpeg stdout not captured"))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        let frame_len = width as usize * height as usize * 3;
        let max_size = self.settings.max_size;
        let mut reader = BufReader::new(stdout);
        let mut frames = Vec::with_capacity(plan.target_frames as usize);

        while (frames.len() as u64) < plan.target_frames {
            let mut buf = vec![0u8; frame_len];
            match reader.read_exact(&mut buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let Some(frame) = RgbImage::from_raw(width, height, buf) else {
                break;
            };
            let shrunk = tokio::task::spawn_blocking(move || shrink_frame(frame, max_size))
                .await
                .map_err(std::io::Error::other)?;
            frames.push(shrunk);
        }
        drop(reader);

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            if frames.is_empty() {
                return Err(ThumbnailError::Decode {
                    path: source.to_path_buf(),
                    message: if stderr.trim().is_empty() {
                        format!("exit status {status}")
                    } else {
                        stderr.trim().to_string()
                    },
                });
            }
            warn!(
                path = %source.display(),
                frames = frames.len(),
                stderr = %stderr.trim(),
                "ffmpeg exited with an error after producing frames"
            );
        }

        Ok(frames)
    }
}
