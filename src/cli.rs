//! Minimal CLI parsing.

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use crate::config::FfmpegConfig;
use crate::services::thumbnail::ClipSettings;

pub const USAGE: &str = "\
usage: vidshelf [--config PATH] [COMMAND]

commands:
  scan                       run one library scan and wait for thumbnails (default)
  serve                      scan at startup, then on scan_schedule until interrupted
  list [--page N] [--size N] list indexed videos
  search TAG... [--all]      videos carrying any (or all) of the tags
  show ID|THUMBNAIL_ID       one video by record id or thumbnail id
  tags                       list tags with their video counts
  thumbnail --source P --dest P [--duration S] [--fps N] [--max-size PX]
            [--ffmpeg BIN] [--ffprobe BIN]
                             generate one thumbnail (used by the worker)";

/// Arguments of the internal `thumbnail` subcommand
#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailArgs {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub settings: ClipSettings,
    pub ffmpeg: FfmpegConfig,
}

/// How `show` looks a video up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoKey {
    Id(i64),
    ThumbnailId(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Scan,
    Serve,
    List { page: u32, size: u32 },
    Search { tags: Vec<String>, match_all: bool },
    Show(VideoKey),
    Tags,
    Thumbnail(ThumbnailArgs),
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CliOptions {
    pub config_path: Option<PathBuf>,
    pub command: Command,
}

impl CliOptions {
    pub fn from_args() -> Result<Self> {
        Self::parse(env::args_os().skip(1))
    }

    /// Parse arguments (program name excluded). Paths may be any OS string;
    /// every other argument must be UTF-8.
    pub fn parse<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut config_path = None;
        let mut rest = Vec::new();
        let mut args = args.into_iter().map(Into::into);
        while let Some(arg) = args.next() {
            match arg.to_str() {
                Some("--config") => {
                    let value = args.next().context("--config requires a path")?;
                    config_path = Some(PathBuf::from(value));
                }
                Some(flag) if flag.starts_with("--config=") => {
                    config_path = Some(PathBuf::from(&flag["--config=".len()..]));
                }
                Some("-h" | "--help") => {
                    return Ok(Self {
                        config_path,
                        command: Command::Help,
                    });
                }
                _ => rest.push(arg),
            }
        }

        let mut rest = rest.into_iter();
        let name = rest.next().map(utf8).transpose()?;
        let command = match name.as_deref() {
            None | Some("scan") => no_more_args(rest, Command::Scan)?,
            Some("serve") => no_more_args(rest, Command::Serve)?,
            Some("list") => parse_list(rest)?,
            Some("search") => parse_search(rest)?,
            Some("show") => parse_show(rest)?,
            Some("tags") => no_more_args(rest, Command::Tags)?,
            Some("thumbnail") => Command::Thumbnail(parse_thumbnail(rest)?),
            Some("help") => Command::Help,
            Some(other) => bail!("unknown command '{}'", other),
        };

        Ok(Self {
            config_path,
            command,
        })
    }
}

fn utf8(arg: OsString) -> Result<String> {
    arg.into_string()
        .map_err(|arg| anyhow::anyhow!("argument '{}' is not valid UTF-8", arg.to_string_lossy()))
}

fn no_more_args(mut args: impl Iterator<Item = OsString>, command: Command) -> Result<Command> {
    match args.next() {
        Some(extra) => bail!("unexpected argument '{}'", extra.to_string_lossy()),
        None => Ok(command),
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<OsString>) -> Result<T> {
    let value = utf8(value.with_context(|| format!("{} requires a value", flag))?)?;
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid value '{}' for {}", value, flag))
}

fn parse_list(mut args: impl Iterator<Item = OsString>) -> Result<Command> {
    let (mut page, mut size) = (1, 50);
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--page") => page = parse_number("--page", args.next())?,
            Some("--size") => size = parse_number("--size", args.next())?,
            _ => bail!("unexpected argument '{}' for list", arg.to_string_lossy()),
        }
    }
    if page == 0 || size == 0 {
        bail!("--page and --size must be at least 1");
    }
    Ok(Command::List { page, size })
}

fn parse_search(args: impl Iterator<Item = OsString>) -> Result<Command> {
    let mut tags = Vec::new();
    let mut match_all = false;
    for arg in args {
        match arg.to_str() {
            Some("--all") => match_all = true,
            Some("--any") => match_all = false,
            _ => tags.push(utf8(arg)?),
        }
    }
    if tags.is_empty() {
        bail!("search requires at least one tag");
    }
    Ok(Command::Search { tags, match_all })
}

/// A numeric argument is a record id, anything else a thumbnail id
fn parse_show(mut args: impl Iterator<Item = OsString>) -> Result<Command> {
    let key = utf8(args.next().context("show requires a video id or thumbnail id")?)?;
    let key = match key.parse::<i64>() {
        Ok(id) => VideoKey::Id(id),
        Err(_) => VideoKey::ThumbnailId(key),
    };
    no_more_args(args, Command::Show(key))
}

fn parse_thumbnail(mut args: impl Iterator<Item = OsString>) -> Result<ThumbnailArgs> {
    let defaults = crate::config::ThumbnailConfig::default();
    let mut source = None;
    let mut dest = None;
    let mut settings = ClipSettings::from(&defaults);
    let mut ffmpeg = FfmpegConfig::default();

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--source") => source = args.next().map(PathBuf::from),
            Some("--dest") => dest = args.next().map(PathBuf::from),
            Some("--duration") => settings.clip_duration = parse_number("--duration", args.next())?,
            Some("--fps") => settings.fps = parse_number("--fps", args.next())?,
            Some("--max-size") => settings.max_size = parse_number("--max-size", args.next())?,
            Some("--ffmpeg") => {
                ffmpeg.ffmpeg_path = utf8(args.next().context("--ffmpeg requires a value")?)?;
            }
            Some("--ffprobe") => {
                ffmpeg.ffprobe_path = utf8(args.next().context("--ffprobe requires a value")?)?;
            }
            _ => bail!("unexpected argument '{}' for thumbnail", arg.to_string_lossy()),
        }
    }

    if !(settings.clip_duration > 0.0 && settings.fps > 0.0 && settings.max_size > 0) {
        bail!("--duration, --fps and --max-size must be positive");
    }

    Ok(ThumbnailArgs {
        source: source.context("thumbnail requires --source")?,
        dest: dest.context("thumbnail requires --dest")?,
        settings,
        ffmpeg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<CliOptions> {
        CliOptions::parse(args.iter().copied())
    }

    #[test]
    fn test_default_is_scan() {
        let options = parse(&[]).unwrap();
        assert_eq!(options.command, Command::Scan);
        assert_eq!(options.config_path, None);
    }

    #[test]
    fn test_config_flag_anywhere() {
        let options = parse(&["serve", "--config", "/etc/vidshelf.yaml"]).unwrap();
        assert_eq!(options.command, Command::Serve);
        assert_eq!(options.config_path, Some(PathBuf::from("/etc/vidshelf.yaml")));

        let options = parse(&["--config=/tmp/c.yaml", "scan"]).unwrap();
        assert_eq!(options.config_path, Some(PathBuf::from("/tmp/c.yaml")));
    }

    #[test]
    fn test_list_paging() {
        assert_eq!(parse(&["list"]).unwrap().command, Command::List { page: 1, size: 50 });
        assert_eq!(
            parse(&["list", "--page", "3", "--size", "10"]).unwrap().command,
            Command::List { page: 3, size: 10 }
        );
        assert!(parse(&["list", "--page", "0"]).is_err());
        assert!(parse(&["list", "--size", "many"]).is_err());
    }

    #[test]
    fn test_search() {
        assert_eq!(
            parse(&["search", "Comedy", "funny", "--all"]).unwrap().command,
            Command::Search {
                tags: vec!["Comedy".to_string(), "funny".to_string()],
                match_all: true,
            }
        );
        assert!(parse(&["search", "--all"]).is_err());
    }

    #[test]
    fn test_thumbnail_args() {
        let options = parse(&[
            "thumbnail", "--source", "/v/a.mp4", "--dest", "/t/x.gif", "--duration", "2.5",
            "--fps", "10", "--max-size", "320", "--ffmpeg", "/opt/ffmpeg",
        ])
        .unwrap();

        assert_matches!(options.command, Command::Thumbnail(args) => {
            assert_eq!(args.source, PathBuf::from("/v/a.mp4"));
            assert_eq!(args.dest, PathBuf::from("/t/x.gif"));
            assert_eq!(args.settings.clip_duration, 2.5);
            assert_eq!(args.settings.fps, 10.0);
            assert_eq!(args.settings.max_size, 320);
            assert_eq!(args.ffmpeg.ffmpeg_path, "/opt/ffmpeg");
            assert_eq!(args.ffmpeg.ffprobe_path, FfmpegConfig::default().ffprobe_path);
        });
    }

    #[test]
    fn test_thumbnail_requires_paths() {
        assert!(parse(&["thumbnail", "--source", "/v/a.mp4"]).is_err());
        assert!(parse(&["thumbnail", "--source", "a", "--dest", "b", "--fps", "0"]).is_err());
    }

    #[test]
    fn test_show_by_id_or_thumbnail_id() {
        assert_eq!(parse(&["show", "42"]).unwrap().command, Command::Show(VideoKey::Id(42)));
        assert_eq!(
            parse(&["show", "0f3a9c"]).unwrap().command,
            Command::Show(VideoKey::ThumbnailId("0f3a9c".to_string()))
        );
        assert!(parse(&["show"]).is_err());
        assert!(parse(&["show", "1", "2"]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_arguments() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let odd = OsStr::from_bytes(b"/v/caf\xe9.mp4");
        let options = CliOptions::parse([
            OsStr::new("thumbnail"),
            OsStr::new("--source"),
            odd,
            OsStr::new("--dest"),
            OsStr::new("/t/x.gif"),
        ])
        .unwrap();
        assert_matches!(options.command, Command::Thumbnail(args) => {
            assert_eq!(args.source, PathBuf::from(odd));
        });

        let options = CliOptions::parse([OsStr::new("--config"), odd]).unwrap();
        assert_eq!(options.config_path, Some(PathBuf::from(odd)));

        assert!(CliOptions::parse([OsStr::new("search"), odd]).is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert!(parse(&["frobnicate"]).is_err());
        assert!(parse(&["scan", "extra"]).is_err());
        assert_eq!(parse(&["--help"]).unwrap().command, Command::Help);
    }
}
