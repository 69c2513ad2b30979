//! # Source Input Validation
//!
//! Allow-list checks for every untrusted field in a source spec. These run
//! before any network I/O; a rejection here is permanent.

use std::path::{Component, Path};

use lazy_static::lazy_static;
use regex::Regex;

use crate::{OperatorError, Result};

lazy_static! {
    /// S3/GCS bucket naming rules (lowercase DNS labels, dots and dashes).
    static ref BUCKET_RE: Regex = Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").unwrap();
    /// Git refs: branch/tag/commit characters only, no shell metacharacters.
    static ref GIT_REF_RE: Regex = Regex::new(r"^[A-Za-z0-9._/-]*$").unwrap();
    /// GitHub owner/repo segments.
    static ref GITHUB_SEGMENT_RE: Regex = Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap();
}

fn rejected(message: impl Into<String>) -> OperatorError {
    OperatorError::ValidationRejected(message.into())
}

/// Validate a bucket name against the allow-list pattern.
pub fn bucket(name: &str) -> Result<()> {
    if BUCKET_RE.is_match(name) {
        Ok(())
    } else {
        Err(rejected(format!("invalid bucket name {:?}", name)))
    }
}

/// Validate an object key: no traversal, no NUL, no leading slash.
pub fn object_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(rejected("object key is empty"));
    }
    if key.starts_with('/') {
        return Err(rejected(format!("object key {:?} has a leading slash", key)));
    }
    if key.contains('\0') {
        return Err(rejected("object key contains NUL"));
    }
    if key.split('/').any(|segment| segment == "..") {
        return Err(rejected(format!("object key {:?} contains traversal", key)));
    }
    Ok(())
}

/// Validate a git URL scheme: https, ssh (including scp-style), or git.
pub fn git_url(url: &str) -> Result<()> {
    let scp_style = url.starts_with("git@") && url.contains(':');
    if url.starts_with("https://")
        || url.starts_with("ssh://")
        || url.starts_with("git://")
        || scp_style
    {
        Ok(())
    } else {
        Err(rejected(format!("git url {:?} has a disallowed scheme", url)))
    }
}

/// Validate a git ref (branch, tag or commit prefix). Empty is allowed and
/// resolves to HEAD downstream.
pub fn git_ref(reference: &str) -> Result<()> {
    if reference.contains("..") {
        return Err(rejected(format!("git ref {:?} contains traversal", reference)));
    }
    if GIT_REF_RE.is_match(reference) {
        Ok(())
    } else {
        Err(rejected(format!(
            "git ref {:?} contains disallowed characters",
            reference
        )))
    }
}

/// Validate a repository-relative path: relative, no traversal, no NUL.
pub fn repo_path(path: &str) -> Result<()> {
    if path.contains('\0') {
        return Err(rejected("path contains NUL"));
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(rejected(format!("path {:?} is absolute", path)));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(rejected(format!("path {:?} contains traversal", path)));
    }
    Ok(())
}

/// Validate a GitHub owner or repository segment.
pub fn github_segment(segment: &str) -> Result<()> {
    if GITHUB_SEGMENT_RE.is_match(segment) {
        Ok(())
    } else {
        Err(rejected(format!(
            "github owner/repo segment {:?} is invalid",
            segment
        )))
    }
}

/// After a clone, ensure `path` resolves inside `root`. Defends against
/// symlinks pointing out of the checkout.
pub fn resolves_inside(root: &Path, path: &Path) -> Result<std::path::PathBuf> {
    let joined = root.join(path);
    let canonical = joined
        .canonicalize()
        .map_err(|_| OperatorError::NotFound(format!("path {:?} not found in repository", path)))?;
    let canonical_root = root
        .canonicalize()
        .map_err(|e| OperatorError::Internal(format!("canonicalize clone root: {e}")))?;
    if canonical.starts_with(&canonical_root) {
        Ok(canonical)
    } else {
        Err(rejected(format!(
            "path {:?} escapes the repository root",
            path
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_normal_buckets_and_keys() {
        assert!(bucket("my-functions").is_ok());
        assert!(bucket("functions.prod.acme").is_ok());
        assert!(object_key("app/main.py").is_ok());
        assert!(object_key("app/v1/").is_ok());
    }

    #[test]
    fn rejects_bad_buckets() {
        assert!(bucket("").is_err());
        assert!(bucket("UPPER").is_err());
        assert!(bucket("a").is_err());
        assert!(bucket("has spaces").is_err());
    }

    #[test]
    fn rejects_traversal_keys_before_io() {
        assert!(object_key("../etc/passwd").is_err());
        assert!(object_key("app/../../secret").is_err());
        assert!(object_key("/absolute").is_err());
        assert!(object_key("nul\0byte").is_err());
    }

    #[test]
    fn git_url_schemes_are_allow_listed() {
        assert!(git_url("https://github.com/acme/fns.git").is_ok());
        assert!(git_url("ssh://git@github.com/acme/fns.git").is_ok());
        assert!(git_url("git://github.com/acme/fns.git").is_ok());
        assert!(git_url("git@github.com:acme/fns.git").is_ok());
        assert!(git_url("file:///etc").is_err());
        assert!(git_url("http://insecure.example.com/repo").is_err());
    }

    #[test]
    fn git_refs_reject_shell_metacharacters() {
        assert!(git_ref("").is_ok());
        assert!(git_ref("main").is_ok());
        assert!(git_ref("release/v1.2.0").is_ok());
        assert!(git_ref("8f4c1d2").is_ok());
        assert!(git_ref("main; rm -rf /").is_err());
        assert!(git_ref("$(whoami)").is_err());
        assert!(git_ref("a..b").is_err());
    }

    #[test]
    fn repo_paths_reject_traversal() {
        assert!(repo_path("fn/main.py").is_ok());
        assert!(repo_path("../../etc").is_err());
        assert!(repo_path("/etc/passwd").is_err());
        assert!(repo_path("ok/../../nope").is_err());
    }

    #[test]
    fn github_segments_are_constrained() {
        assert!(github_segment("acme").is_ok());
        assert!(github_segment("my_repo.rs").is_ok());
        assert!(github_segment("a/b").is_err());
        assert!(github_segment("").is_err());
    }

    #[test]
    fn resolves_inside_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/main.py"), b"ok").unwrap();

        let found = resolves_inside(dir.path(), Path::new("sub/main.py")).unwrap();
        assert!(found.ends_with("sub/main.py"));

        // A symlink pointing out of the root is caught at canonicalization.
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink("/etc", dir.path().join("escape")).unwrap();
            assert!(resolves_inside(dir.path(), Path::new("escape/passwd")).is_err());
        }
    }
}
