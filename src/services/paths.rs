//! Path classification against the configured library roots

use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path.
///
/// Relative paths are resolved against the current directory, `.` components
/// are dropped and `..` pops the previous component. Symlinks are not resolved.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Comparison key: normalized, and lower-cased where the filesystem is case-insensitive
fn comparison_key(path: &Path) -> PathBuf {
    let normalized = normalize(path);
    if cfg!(any(windows, target_os = "macos")) {
        PathBuf::from(normalized.to_string_lossy().to_lowercase())
    } else {
        normalized
    }
}

/// Whether `path` lies under any of `roots`.
///
/// Matching is component-wise: `/lib2/a.mp4` is not under `/lib`.
pub fn is_within_roots<P: AsRef<Path>>(path: &Path, roots: &[P]) -> bool {
    if roots.is_empty() {
        return false;
    }
    let candidate = comparison_key(path);
    roots
        .iter()
        .any(|root| candidate.starts_with(comparison_key(root.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_resolves_dots() {
        assert_eq!(
            normalize(Path::new("/lib/./Comedy/../Drama/a.mp4")),
            PathBuf::from("/lib/Drama/a.mp4")
        );
    }

    #[test]
    fn test_relative_path_becomes_absolute() {
        assert!(normalize(Path::new("videos/a.mp4")).is_absolute());
    }

    #[test]
    fn test_within_roots() {
        let roots = [PathBuf::from("/lib"), PathBuf::from("/other/")];
        assert!(is_within_roots(Path::new("/lib/a.mp4"), &roots));
        assert!(is_within_roots(Path::new("/lib/deep/er/a.mp4"), &roots));
        assert!(is_within_roots(Path::new("/other/x.mkv"), &roots));
        assert!(!is_within_roots(Path::new("/elsewhere/a.mp4"), &roots));
    }

    #[test]
    fn test_prefix_is_component_wise() {
        let roots = [PathBuf::from("/lib")];
        assert!(!is_within_roots(Path::new("/lib2/a.mp4"), &roots));
        assert!(!is_within_roots(Path::new("/library/a.mp4"), &roots));
    }

    #[test]
    fn test_dot_dot_escapes_root() {
        let roots = [PathBuf::from("/lib")];
        assert!(!is_within_roots(Path::new("/lib/../etc/a.mp4"), &roots));
    }

    #[test]
    fn test_empty_roots() {
        let roots: [PathBuf; 0] = [];
        assert!(!is_within_roots(Path::new("/lib/a.mp4"), &roots));
    }
}
