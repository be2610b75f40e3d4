//! Safe resolution of client-supplied paths inside the share root.
//!
//! Every request path is scrubbed textually before touching the filesystem,
//! then canonicalized and checked for containment below the canonical share
//! root. The containment comparison is lowercased to tolerate
//! case-insensitive filesystems (std `to_lowercase`, no locale tailoring).

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Resolves untrusted relative paths against the canonical share root.
#[derive(Clone, Debug)]
pub struct PathGuard {
    root: PathBuf,
    root_folded: String,
}

/// Rejection reason for a client-supplied path.
#[derive(Debug, PartialEq, Eq)]
pub struct PathError;

impl PathGuard {
    /// Canonicalize the share root and build the guard. Fails if the root
    /// does not exist.
    pub fn new(root: &Path) -> io::Result<Self> {
        let root = std::fs::canonicalize(root)?;
        let root_folded = fold(&root);
        Ok(Self { root, root_folded })
    }

    /// The canonical share root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path that must already exist. Follows symlinks and rejects
    /// any result outside the share root.
    pub async fn resolve_read(&self, relative: &str) -> Result<PathBuf, PathError> {
        let scrubbed = scrub(relative);
        if targets_state_dir(&scrubbed) {
            return Err(PathError);
        }
        let joined = self.root.join(scrubbed);
        let canonical = fs::canonicalize(&joined).await.map_err(|_| PathError)?;
        if self.contains(&canonical) {
            Ok(canonical)
        } else {
            Err(PathError)
        }
    }

    /// Resolve a path whose leaf may not yet exist. The parent directory is
    /// canonicalized when present so symlinked parents cannot escape.
    pub async fn resolve_write(&self, relative: &str) -> Result<PathBuf, PathError> {
        let scrubbed = scrub(relative);
        if scrubbed.as_os_str().is_empty() || targets_state_dir(&scrubbed) {
            return Err(PathError);
        }
        let joined = self.root.join(&scrubbed);
        let Some(file_name) = joined.file_name().map(|name| name.to_os_string()) else {
            return Err(PathError);
        };
        let parent = joined.parent().unwrap_or(&self.root);
        let resolved = match fs::canonicalize(parent).await {
            Ok(canonical_parent) => canonical_parent.join(&file_name),
            // Parent missing entirely: containment falls back to the
            // scrubbed textual join, which cannot contain `..`.
            Err(_) => joined.clone(),
        };
        if self.contains(&resolved) {
            Ok(resolved)
        } else {
            Err(PathError)
        }
    }

    /// Share-relative form of an absolute path, forward-slashed.
    pub fn relative_of(&self, absolute: &Path) -> Option<String> {
        let stripped = absolute.strip_prefix(&self.root).ok()?;
        let relative = stripped
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        Some(relative)
    }

    fn contains(&self, candidate: &Path) -> bool {
        let folded = fold(candidate);
        folded == self.root_folded || folded.starts_with(&format!("{}/", self.root_folded))
    }
}

/// Textual scrub: `\` becomes `/`, leading separators drop, and `.`/`..`
/// segments are removed before any filesystem call.
fn scrub(relative: &str) -> PathBuf {
    let normalized = relative.replace('\\', "/");
    let mut scrubbed = PathBuf::new();
    for segment in normalized.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        if segment.contains('\0') {
            continue;
        }
        scrubbed.push(segment);
    }
    scrubbed
}

/// The server's own state directory is never addressable by clients.
fn targets_state_dir(scrubbed: &Path) -> bool {
    scrubbed
        .components()
        .next()
        .map(|first| {
            first
                .as_os_str()
                .to_string_lossy()
                .eq_ignore_ascii_case(crate::config::STATE_DIR)
        })
        .unwrap_or(false)
}

fn fold(path: &Path) -> String {
    path.to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "/")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::{PathError, PathGuard, scrub};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn make_guard() -> (tempfile::TempDir, PathGuard) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("share");
        std::fs::create_dir_all(&root).expect("create root");
        let guard = PathGuard::new(&root).expect("guard");
        (temp, guard)
    }

    #[test]
    fn scrub_strips_traversal_segments() {
        assert_eq!(scrub("../../etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(scrub("./a/./b"), PathBuf::from("a/b"));
        assert_eq!(scrub("/a//b/"), PathBuf::from("a/b"));
        assert_eq!(scrub("a\\b\\..\\c"), PathBuf::from("a/b/c"));
        assert_eq!(scrub(".."), PathBuf::new());
    }

    #[tokio::test]
    async fn resolve_read_accepts_contained_file() {
        let (_temp, guard) = make_guard();
        std::fs::write(guard.root().join("a.txt"), b"x").expect("write");
        let resolved = guard.resolve_read("a.txt").await.expect("resolve");
        assert!(resolved.ends_with("a.txt"));
    }

    #[tokio::test]
    async fn resolve_read_rejects_missing_and_traversal() {
        let (_temp, guard) = make_guard();
        assert_eq!(guard.resolve_read("missing.txt").await, Err(PathError));
        // Traversal segments are scrubbed; the scrubbed remainder does not
        // exist, so the request is still denied.
        assert_eq!(
            guard.resolve_read("../../etc/passwd").await,
            Err(PathError)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_read_rejects_symlink_escape() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("share");
        std::fs::create_dir_all(&root).expect("create root");
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside");
        symlink(&outside, root.join("link")).expect("symlink");

        let guard = PathGuard::new(&root).expect("guard");
        assert_eq!(guard.resolve_read("link").await, Err(PathError));
    }

    #[tokio::test]
    async fn resolve_write_allows_missing_leaf() {
        let (_temp, guard) = make_guard();
        let resolved = guard.resolve_write("new/file.bin").await.expect("resolve");
        assert!(resolved.ends_with("new/file.bin"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_write_rejects_symlinked_parent_escape() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("share");
        std::fs::create_dir_all(&root).expect("create root");
        let outside = temp.path().join("elsewhere");
        std::fs::create_dir_all(&outside).expect("create outside");
        symlink(&outside, root.join("sneaky")).expect("symlink");

        let guard = PathGuard::new(&root).expect("guard");
        assert_eq!(
            guard.resolve_write("sneaky/file.bin").await,
            Err(PathError)
        );
    }

    #[tokio::test]
    async fn resolve_write_rejects_empty_after_scrub() {
        let (_temp, guard) = make_guard();
        assert_eq!(guard.resolve_write("..").await, Err(PathError));
        assert_eq!(guard.resolve_write("/").await, Err(PathError));
    }

    #[tokio::test]
    async fn state_directory_is_unaddressable() {
        let (_temp, guard) = make_guard();
        std::fs::create_dir_all(guard.root().join(".fileshare")).expect("state dir");
        std::fs::write(guard.root().join(".fileshare/users.json"), b"[]").expect("seed");

        assert_eq!(
            guard.resolve_read(".fileshare/users.json").await,
            Err(PathError)
        );
        assert_eq!(
            guard.resolve_read(".FileShare/users.json").await,
            Err(PathError)
        );
        assert_eq!(
            guard.resolve_write(".fileshare/evil.json").await,
            Err(PathError)
        );
    }

    #[tokio::test]
    async fn relative_of_uses_forward_slashes() {
        let (_temp, guard) = make_guard();
        std::fs::create_dir_all(guard.root().join("docs")).expect("mkdir");
        std::fs::write(guard.root().join("docs/a.txt"), b"x").expect("write");
        let resolved = guard.resolve_read("docs/a.txt").await.expect("resolve");
        assert_eq!(guard.relative_of(&resolved).as_deref(), Some("docs/a.txt"));
    }
}
