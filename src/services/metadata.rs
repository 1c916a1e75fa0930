//! Sidecar metadata and directory-derived tags
//!
//! A video `Show/ep1.mp4` may carry a companion `Show/ep1.info` text file:
//!
//! ```text
//! !StandUp
//! #funny
//! #live
//! ```
//!
//! A line starting with `!` sets the category (the last one wins), a line
//! starting with `#` adds a tag. Everything else is ignored. Each directory
//! between the library root and the file also becomes a tag.

use std::io::ErrorKind;
use std::path::{Component, Path};

use tracing::warn;

/// Sidecar file extension
pub const SIDECAR_EXTENSION: &str = "info";

/// Category and tags gathered for one video
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoMetadata {
    pub category: Option<String>,
    /// Ordered and unique; directory tags come first
    pub tags: Vec<String>,
}

impl VideoMetadata {
    fn add_tag(&mut self, tag: &str) {
        if !tag.is_empty() && !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
    }
}

/// Directory names between `root` and the file's containing directory
pub fn directory_tags(video_path: &Path, root: &Path) -> Vec<String> {
    let Some(parent) = video_path.parent() else {
        return Vec::new();
    };
    let Ok(relative) = parent.strip_prefix(root) else {
        return Vec::new();
    };
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// Read the category and tags for a video.
///
/// A missing or unreadable sidecar contributes nothing; only directory tags remain.
pub fn read_video_metadata(video_path: &Path, root: &Path) -> VideoMetadata {
    let mut metadata = VideoMetadata::default();
    for tag in directory_tags(video_path, root) {
        metadata.add_tag(&tag);
    }

    let sidecar = video_path.with_extension(SIDECAR_EXTENSION);
    match std::fs::read_to_string(&sidecar) {
        Ok(contents) => apply_sidecar(&mut metadata, &contents),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %sidecar.display(), error = %e, "Failed to read sidecar metadata");
        }
    }
    metadata
}

fn apply_sidecar(metadata: &mut VideoMetadata, contents: &str) {
    for line in contents.lines() {
        let line = line.trim();
        if let Some(category) = line.strip_prefix('!') {
            let category = category.trim();
            if !category.is_empty() {
                metadata.category = Some(category.to_string());
            }
        } else if let Some(tag) = line.strip_prefix('#') {
            metadata.add_tag(tag.trim());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_directory_tags() {
        let root = Path::new("/lib");
        assert_eq!(
            directory_tags(Path::new("/lib/Comedy/Live/a.mp4"), root),
            vec!["Comedy".to_string(), "Live".to_string()]
        );
        assert!(directory_tags(Path::new("/lib/a.mp4"), root).is_empty());
        assert!(directory_tags(Path::new("/other/a.mp4"), root).is_empty());
    }

    #[test]
    fn test_sidecar_category_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        let comedy = dir.path().join("Comedy");
        std::fs::create_dir_all(&comedy).unwrap();
        let video = comedy.join("a.mp4");
        std::fs::write(&video, b"").unwrap();
        std::fs::write(comedy.join("a.info"), "!StandUp\n#funny\n").unwrap();

        let metadata = read_video_metadata(&video, dir.path());

        assert_eq!(
            metadata,
            VideoMetadata {
                category: Some("StandUp".to_string()),
                tags: vec!["Comedy".to_string(), "funny".to_string()],
            }
        );
    }

    #[test]
    fn test_sidecar_rules() {
        let mut metadata = VideoMetadata {
            category: None,
            tags: vec!["Comedy".to_string()],
        };
        let contents = "  !First \n!\n# \n#Comedy\n  #  live  \nplain text\n!Second\n#live\n";

        apply_sidecar(&mut metadata, contents);

        assert_eq!(metadata.category.as_deref(), Some("Second"));
        assert_eq!(metadata.tags, vec!["Comedy".to_string(), "live".to_string()]);
    }

    #[test]
    fn test_missing_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("a.mp4");

        let metadata = read_video_metadata(&video, dir.path());
        assert_eq!(metadata, VideoMetadata::default());
    }

    #[test]
    fn test_invalid_utf8_sidecar_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("Drama").join("a.mp4");
        std::fs::create_dir_all(video.parent().unwrap()).unwrap();
        std::fs::write(video.with_extension("info"), [0xff, 0xfe, b'!', b'x']).unwrap();

        let metadata = read_video_metadata(&video, dir.path());
        assert_eq!(metadata.category, None);
        assert_eq!(metadata.tags, vec!["Drama".to_string()]);
    }
}
