// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Workspace path safety and file listing.
//!
//! Every client-supplied path is resolved against the workspace root and
//! must stay inside it after symlink resolution. The gate rejects absolute
//! paths outright so error responses never leak filesystem layout.

use glob::Pattern;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use treq_api::WorkspaceFile;
use treq_core::{Error, ErrorKind, Result};

fn outside_workspace(input: &str) -> Error {
    Error::new(
        ErrorKind::PathOutsideWorkspace,
        format!("path {input} resolves outside the workspace"),
    )
}

/// Canonicalizes the configured workspace root, which must exist and be a
/// directory.
pub fn canonical_root(root: &str) -> Result<PathBuf> {
    let canonical = Path::new(root)
        .canonicalize()
        .map_err(|e| Error::internal(format!("workspace root {root}: {e}")))?;
    if !canonical.is_dir() {
        return Err(Error::internal(format!("workspace root {root} is not a directory")));
    }
    Ok(canonical)
}

/// Checks that `input` stays lexically inside the root: no absolute paths,
/// and `..` may never escape.
fn check_lexical(input: &str) -> Result<()> {
    let path = Path::new(input);
    if path.is_absolute() {
        return Err(outside_workspace(input));
    }
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(outside_workspace(input));
                }
            },
            Component::Normal(_) => depth += 1,
            Component::CurDir => {},
            Component::RootDir | Component::Prefix(_) => {
                return Err(outside_workspace(input));
            },
        }
    }
    Ok(())
}

/// Resolves a client-supplied relative path inside the workspace.
///
/// The realpath of `root ⊕ input` must keep `root` as a prefix; symlinks
/// that point out of the workspace are rejected the same way `..` is.
///
/// # Errors
///
/// `PATH_OUTSIDE_WORKSPACE` for escapes, `FILE_NOT_FOUND` for paths that
/// pass the gate but do not exist.
pub fn resolve_path(root: &Path, input: &str) -> Result<PathBuf> {
    check_lexical(input)?;

    let joined = root.join(input);
    let canonical = joined.canonicalize().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::new(ErrorKind::FileNotFound, format!("file {input} not found"))
        } else {
            Error::internal(format!("resolving {input}: {e}"))
        }
    })?;

    if !canonical.starts_with(root) {
        return Err(outside_workspace(input));
    }
    debug!(input, resolved = %canonical.display(), "Resolved workspace path");
    Ok(canonical)
}

/// Resolves a target path for a file that may not exist yet (importer
/// apply). Parent directories are created inside the workspace; the
/// canonicalized parent must still live under the root.
pub fn resolve_new_path(root: &Path, input: &str) -> Result<PathBuf> {
    check_lexical(input)?;

    let joined = root.join(input);
    let file_name = joined
        .file_name()
        .map(std::ffi::OsStr::to_owned)
        .ok_or_else(|| Error::validation(format!("path {input} has no file name")))?;
    let parent = joined.parent().unwrap_or(root);
    std::fs::create_dir_all(parent)
        .map_err(|e| Error::internal(format!("creating {}: {e}", parent.display())))?;
    let canonical_parent = parent
        .canonicalize()
        .map_err(|e| Error::internal(format!("resolving {}: {e}", parent.display())))?;
    if !canonical_parent.starts_with(root) {
        return Err(outside_workspace(input));
    }
    Ok(canonical_parent.join(file_name))
}

fn is_ignored(relative: &str, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|pattern| pattern.matches(relative))
}

fn collect_files(
    root: &Path,
    dir: &Path,
    patterns: &[Pattern],
    files: &mut Vec<WorkspaceFile>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        if is_ignored(&relative, patterns) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, patterns, files)?;
        } else if file_type.is_file() {
            let is_http = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("http") || ext.eq_ignore_ascii_case("rest"));
            if is_http {
                files.push(WorkspaceFile { path: relative, size: entry.metadata()?.len() });
            }
        }
    }
    Ok(())
}

/// Lists `.http`/`.rest` files under the workspace root, honoring ignore
/// globs, sorted by path.
pub fn list_http_files(root: &Path, ignore: &[String]) -> Result<Vec<WorkspaceFile>> {
    let mut patterns: Vec<Pattern> = Vec::new();
    for raw in ignore {
        if let Ok(pattern) = Pattern::new(raw) {
            patterns.push(pattern);
        }
        // "dir/**" must also match the directory itself, or the walk would
        // still descend into it.
        if let Some(prefix) = raw.strip_suffix("/**") {
            if let Ok(pattern) = Pattern::new(prefix) {
                patterns.push(pattern);
            }
        }
    }

    let mut files = Vec::new();
    collect_files(root, root, &patterns, &mut files)
        .map_err(|e| Error::internal(format!("listing workspace: {e}")))?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("api/v1")).unwrap();
        std::fs::write(dir.path().join("users.http"), "GET http://x/\n").unwrap();
        std::fs::write(dir.path().join("api/v1/orders.http"), "GET http://x/\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a request file").unwrap();
        let root = canonical_root(dir.path().to_str().unwrap()).unwrap();
        (dir, root)
    }

    #[test]
    fn traversal_is_rejected() {
        let (_dir, root) = workspace();
        let err = resolve_path(&root, "../etc/passwd").unwrap_err();
        assert_eq!(err.code(), "PATH_OUTSIDE_WORKSPACE");
    }

    #[test]
    fn absolute_paths_are_rejected() {
        let (_dir, root) = workspace();
        let err = resolve_path(&root, "/etc/passwd").unwrap_err();
        assert_eq!(err.code(), "PATH_OUTSIDE_WORKSPACE");
    }

    #[test]
    fn inner_dotdot_that_stays_inside_is_fine() {
        let (_dir, root) = workspace();
        let resolved = resolve_path(&root, "api/../users.http").unwrap();
        assert!(resolved.ends_with("users.http"));
    }

    #[test]
    fn missing_file_inside_workspace_is_not_found() {
        let (_dir, root) = workspace();
        let err = resolve_path(&root, "nope.http").unwrap_err();
        assert_eq!(err.code(), "FILE_NOT_FOUND");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let (dir, root) = workspace();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.http"), "GET http://x/\n").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.http"),
            dir.path().join("sneaky.http"),
        )
        .unwrap();
        let err = resolve_path(&root, "sneaky.http").unwrap_err();
        assert_eq!(err.code(), "PATH_OUTSIDE_WORKSPACE");
    }

    #[test]
    fn listing_finds_http_files_recursively() {
        let (_dir, root) = workspace();
        let files = list_http_files(&root, &[]).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["api/v1/orders.http", "users.http"]);
    }

    #[test]
    fn ignore_globs_prune_listings() {
        let (_dir, root) = workspace();
        let files = list_http_files(&root, &["api/**".to_string()]).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["users.http"]);
    }
}
