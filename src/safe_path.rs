//! Path validation to keep untrusted object keys inside the output directory.

use crate::error::DownloadError;
use path_clean::PathClean;
use std::path::{Path, PathBuf};

fn traversal(path: &str, reason: &str) -> DownloadError {
    DownloadError::PathTraversal {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Safely join a base directory with an untrusted relative path.
///
/// Rejects empty or whitespace-only input, absolute paths, anything starting
/// with `.` (hidden files and leading traversal segments alike), and any path
/// that resolves outside `base_dir` after normalization. Interior `..`
/// segments that stay inside the base (`a/b/../c`) are allowed.
///
/// The check is purely lexical; nothing on the filesystem is touched.
pub fn safe_join(base_dir: &Path, untrusted_path: &str) -> Result<PathBuf, DownloadError> {
    if untrusted_path.trim().is_empty() {
        return Err(traversal(untrusted_path, "empty path"));
    }

    if Path::new(untrusted_path).is_absolute() {
        return Err(traversal(untrusted_path, "absolute path not allowed"));
    }

    if untrusted_path.starts_with('.') {
        return Err(traversal(untrusted_path, "path cannot start with '.'"));
    }

    let base = base_dir.clean();
    let joined = base.join(untrusted_path).clean();

    if !joined.starts_with(&base) {
        return Err(traversal(
            untrusted_path,
            &format!("path escapes base directory {}", base.display()),
        ));
    }

    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PathBuf {
        PathBuf::from("/data")
    }

    #[test]
    fn plain_file_is_allowed() {
        let p = safe_join(&base(), "file.json").unwrap();
        assert_eq!(p, PathBuf::from("/data/file.json"));
    }

    #[test]
    fn nested_path_is_allowed() {
        let p = safe_join(&base(), "subdir/file.json").unwrap();
        assert_eq!(p, PathBuf::from("/data/subdir/file.json"));
    }

    #[test]
    fn interior_dotdot_that_stays_inside_is_allowed() {
        let p = safe_join(&base(), "a/b/../c/file.json").unwrap();
        assert_eq!(p, PathBuf::from("/data/a/c/file.json"));
    }

    #[test]
    fn empty_and_whitespace_are_rejected() {
        assert!(safe_join(&base(), "").is_err());
        assert!(safe_join(&base(), "   ").is_err());
    }

    #[test]
    fn absolute_path_is_rejected() {
        assert!(safe_join(&base(), "/etc/passwd").is_err());
    }

    #[test]
    fn leading_dot_is_rejected() {
        assert!(safe_join(&base(), "../etc/passwd").is_err());
        assert!(safe_join(&base(), "./file").is_err());
        assert!(safe_join(&base(), ".hidden").is_err());
    }

    #[test]
    fn escape_through_interior_dotdot_is_rejected() {
        let err = safe_join(&base(), "foo/../../etc/passwd").unwrap_err();
        match err {
            DownloadError::PathTraversal { reason, .. } => {
                assert!(reason.contains("escapes"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn works_with_relative_base() {
        let p = safe_join(Path::new("out"), "a/file.bin").unwrap();
        assert_eq!(p, PathBuf::from("out/a/file.bin"));
        assert!(safe_join(Path::new("out"), "a/../../file.bin").is_err());
    }
}
