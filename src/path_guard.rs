//! Filesystem path validation.
//!
//! Every path that reaches the supervisor passes through `sanitize` first: it is
//! trimmed, lexically normalized, checked for traversal and length, and made
//! absolute. `validate_project_path` additionally checks the filesystem
//! (read-only) for a usable project directory.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::validation::ValidationResult;

/// Longest accepted path, in characters, after normalization.
pub const MAX_PATH_LEN: usize = 4096;
/// The dependency-declaration file every project must contain.
pub const MANIFEST_FILE: &str = "package.json";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path must not be empty")]
    InvalidInput,
    #[error("path contains a parent-directory segment: {0}")]
    PathTraversal(String),
    #[error("path is {0} characters long, limit is 4096")]
    PathTooLong(usize),
    #[error("cannot resolve current directory: {0}")]
    CurrentDir(String),
    #[error("path does not exist: {}", .0.display())]
    NotFound(PathBuf),
    #[error("path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("no package.json found in {}", .0.display())]
    MissingManifest(PathBuf),
    #[error("invalid package.json in {}: {reason}", .path.display())]
    InvalidManifest { path: PathBuf, reason: String },
}

/// Trims, normalizes and absolutizes `path`.
///
/// Fails with `PathTraversal` when a `..` segment survives normalization, i.e.
/// when it would climb above the start of the path.
pub fn sanitize(path: &str) -> Result<PathBuf, PathError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(PathError::InvalidInput);
    }
    let separated = normalize_separators(trimmed);
    let normalized = normalize(Path::new(&separated))
        .ok_or_else(|| PathError::PathTraversal(trimmed.to_string()))?;

    let len = normalized.as_os_str().to_string_lossy().chars().count();
    if len > MAX_PATH_LEN {
        return Err(PathError::PathTooLong(len));
    }

    if normalized.is_absolute() {
        return Ok(normalized);
    }
    let cwd = std::env::current_dir().map_err(|e| PathError::CurrentDir(e.to_string()))?;
    let joined = cwd.join(normalized);
    // cwd is already absolute and free of `..`, so this cannot fail.
    Ok(normalize(&joined).unwrap_or(joined))
}

/// Sanitizes `path` and checks it is an existing directory with a parseable
/// manifest carrying `name` and `version`.
pub fn check_project_path(path: &str) -> Result<PathBuf, PathError> {
    let dir = sanitize(path)?;
    let meta = std::fs::metadata(&dir).map_err(|_| PathError::NotFound(dir.clone()))?;
    if !meta.is_dir() {
        return Err(PathError::NotADirectory(dir));
    }

    let manifest = dir.join(MANIFEST_FILE);
    if !manifest.is_file() {
        return Err(PathError::MissingManifest(dir));
    }
    let raw = std::fs::read_to_string(&manifest).map_err(|e| PathError::InvalidManifest {
        path: dir.clone(),
        reason: e.to_string(),
    })?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| PathError::InvalidManifest {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
    for field in ["name", "version"] {
        let present = value
            .get(field)
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !present {
            return Err(PathError::InvalidManifest {
                path: dir,
                reason: format!("missing \"{}\" field", field),
            });
        }
    }
    Ok(dir)
}

/// `check_project_path` reported as a `ValidationResult` on the `path` field.
pub fn validate_project_path(path: &str) -> ValidationResult {
    match check_project_path(path) {
        Ok(_) => ValidationResult::ok(),
        Err(err) => ValidationResult::invalid("path", err.to_string()),
    }
}

#[cfg(windows)]
fn normalize_separators(path: &str) -> String {
    path.replace('/', "\\")
}

#[cfg(not(windows))]
fn normalize_separators(path: &str) -> String {
    path.to_string()
}

// Lexical normalization: drops `.` and folds `name/..` pairs. Returns `None` if a
// `..` has nothing left to fold against.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_manifest(dir: &Path, body: &str) {
        fs::write(dir.join(MANIFEST_FILE), body).unwrap();
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert_eq!(sanitize(""), Err(PathError::InvalidInput));
        assert_eq!(sanitize("   \t"), Err(PathError::InvalidInput));
    }

    #[test]
    fn rejects_surviving_parent_segments() {
        for path in ["../etc", "a/../../b", "./..", "/.."] {
            assert!(
                matches!(sanitize(path), Err(PathError::PathTraversal(_))),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn folds_parent_segments_that_normalize_away() {
        let path = sanitize("/srv/app/../web/./src").unwrap();
        assert_eq!(path, PathBuf::from("/srv/web/src"));
    }

    #[test]
    fn relative_paths_become_absolute() {
        let path = sanitize("  project  ").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("project"));
    }

    #[test]
    fn rejects_overlong_paths() {
        let long = format!("/{}", "a".repeat(MAX_PATH_LEN + 1));
        assert!(matches!(sanitize(&long), Err(PathError::PathTooLong(_))));
    }

    #[test]
    fn project_path_checks_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        assert!(matches!(
            check_project_path(missing.to_str().unwrap()),
            Err(PathError::NotFound(_))
        ));

        let file = tmp.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            check_project_path(file.to_str().unwrap()),
            Err(PathError::NotADirectory(_))
        ));

        let dir = tmp.path().to_str().unwrap();
        assert!(matches!(check_project_path(dir), Err(PathError::MissingManifest(_))));

        write_manifest(tmp.path(), "{ not json");
        assert!(matches!(
            check_project_path(dir),
            Err(PathError::InvalidManifest { .. })
        ));

        write_manifest(tmp.path(), r#"{"name": "web"}"#);
        let err = check_project_path(dir).unwrap_err();
        assert!(err.to_string().contains("version"));

        write_manifest(tmp.path(), r#"{"name": "web", "version": "1.0.0"}"#);
        assert!(check_project_path(dir).is_ok());
        assert!(validate_project_path(dir).valid);
    }

    #[test]
    fn validation_result_reports_path_field() {
        let result = validate_project_path("../outside");
        assert!(!result.valid);
        assert!(result.error_for("path").is_some());
    }
}
