//! # Git Fetcher
//!
//! Shallow-clones the repository into an ephemeral scratch directory (a
//! `TempDir`, so cleanup happens on every exit path), resolves the requested
//! ref by trying branch, tag, remote branch and commit-hash prefix before
//! falling back to HEAD, and reads the source file from the checkout.
//!
//! libgit2 is blocking, so the whole clone runs on the blocking pool.

use std::collections::BTreeMap;
use std::path::Path;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use tracing::debug;

use crate::models::{GitSource, Language};
use crate::{OperatorError, Result};

use super::{secrets, validate, FetchedSource, MAX_SOURCE_BYTES};

pub async fn fetch(
    spec: &GitSource,
    language: Language,
    secret: Option<BTreeMap<String, Vec<u8>>>,
) -> Result<FetchedSource> {
    validate::git_url(&spec.url)?;
    if let Some(reference) = &spec.git_ref {
        validate::git_ref(reference)?;
    }
    if let Some(path) = &spec.path {
        validate::repo_path(path)?;
    }

    let spec = spec.clone();
    tokio::task::spawn_blocking(move || clone_and_read(&spec, language, secret.as_ref()))
        .await
        .map_err(|e| OperatorError::Internal(format!("git clone task: {e}")))?
}

fn map_git_err(err: git2::Error, what: &str) -> OperatorError {
    use git2::{ErrorClass, ErrorCode};
    match (err.code(), err.class()) {
        (ErrorCode::NotFound, _) => OperatorError::NotFound(format!("{what}: {err}")),
        (ErrorCode::Auth, _) | (_, ErrorClass::Ssh) => {
            OperatorError::AuthFailed(format!("{what}: {err}"))
        }
        (_, ErrorClass::Net) | (_, ErrorClass::Http) => {
            OperatorError::DownloadError(format!("{what}: {err}"))
        }
        _ => OperatorError::DownloadError(format!("{what}: {err}")),
    }
}

fn clone_and_read(
    spec: &GitSource,
    language: Language,
    secret: Option<&BTreeMap<String, Vec<u8>>>,
) -> Result<FetchedSource> {
    // Scratch directory; dropped (and removed) on success and on error.
    let scratch = tempfile::tempdir()
        .map_err(|e| OperatorError::Internal(format!("scratch directory: {e}")))?;

    let ssh_key = secret.and_then(secrets::git_ssh_key);
    let basic = secret.and_then(secrets::git_basic_auth);

    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, _allowed| {
        if let Some(key) = &ssh_key {
            Cred::ssh_key_from_memory(username_from_url.unwrap_or("git"), None, key, None)
        } else if let Some((username, password)) = &basic {
            Cred::userpass_plaintext(username, password)
        } else {
            Cred::default()
        }
    });

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks);
    fetch_options.depth(1);

    let repo = RepoBuilder::new()
        .fetch_options(fetch_options)
        .clone(&spec.url, scratch.path())
        .map_err(|e| map_git_err(e, &format!("clone {}", spec.url)))?;

    let reference = spec.git_ref.as_deref().unwrap_or("");
    let oid = resolve_ref(&repo, reference)?;
    debug!(url = %spec.url, reference, oid = %oid, "resolved git ref");

    checkout(&repo, oid)?;
    read_source_file(scratch.path(), spec.path.as_deref(), language)
}

/// Resolve a user-supplied ref: branch, then tag, then remote branch, then
/// commit-hash prefix, falling back to HEAD. An empty ref is HEAD.
pub(crate) fn resolve_ref(repo: &Repository, reference: &str) -> Result<git2::Oid> {
    let head = || {
        repo.head()
            .and_then(|h| h.peel_to_commit())
            .map(|c| c.id())
            .map_err(|e| map_git_err(e, "resolve HEAD"))
    };

    if reference.is_empty() {
        return head();
    }
    if let Ok(branch) = repo.find_branch(reference, git2::BranchType::Local) {
        if let Ok(commit) = branch.get().peel_to_commit() {
            return Ok(commit.id());
        }
    }
    if let Ok(tag) = repo.find_reference(&format!("refs/tags/{reference}")) {
        if let Ok(commit) = tag.peel_to_commit() {
            return Ok(commit.id());
        }
    }
    if let Ok(branch) = repo.find_branch(&format!("origin/{reference}"), git2::BranchType::Remote) {
        if let Ok(commit) = branch.get().peel_to_commit() {
            return Ok(commit.id());
        }
    }
    if let Ok(object) = repo.revparse_single(reference) {
        if let Some(commit) = object
            .peel(git2::ObjectType::Commit)
            .ok()
            .and_then(|peeled| peeled.into_commit().ok())
        {
            return Ok(commit.id());
        }
    }
    head()
}

fn checkout(repo: &Repository, oid: git2::Oid) -> Result<()> {
    let commit = repo
        .find_commit(oid)
        .map_err(|e| map_git_err(e, "find commit"))?;
    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))
        .map_err(|e| map_git_err(e, "checkout"))?;
    repo.set_head_detached(oid)
        .map_err(|e| map_git_err(e, "detach HEAD"))?;
    Ok(())
}

/// Read the requested file (or the language's conventional filename) from
/// the checkout, re-verifying it stays inside the clone root.
pub(crate) fn read_source_file(
    root: &Path,
    path: Option<&str>,
    language: Language,
) -> Result<FetchedSource> {
    let relative = path.unwrap_or(language.source_filename());
    let resolved = validate::resolves_inside(root, Path::new(relative))?;

    let metadata = std::fs::metadata(&resolved)
        .map_err(|_| OperatorError::NotFound(format!("{relative} not in repository")))?;
    if metadata.len() > MAX_SOURCE_BYTES {
        return Err(OperatorError::DownloadError(format!(
            "{relative} is {} bytes, over the {} byte cap",
            metadata.len(),
            MAX_SOURCE_BYTES
        )));
    }

    let bytes = std::fs::read(&resolved)
        .map_err(|e| OperatorError::DownloadError(format!("read {relative}: {e}")))?;
    let filename = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(language.source_filename())
        .to_string();
    Ok(FetchedSource {
        bytes,
        filename,
        language,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a local repository with one commit, a tag and a branch.
    fn test_repo(dir: &Path) -> (Repository, git2::Oid) {
        let repo = Repository::init(dir).unwrap();
        std::fs::write(dir.join("main.py"), b"def handler(e): return e").unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new("main.py")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();

        let signature = git2::Signature::now("tester", "tester@example.com").unwrap();
        let commit_id = {
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &signature, &signature, "init", &tree, &[])
                .unwrap()
        };
        {
            let object = repo.find_object(commit_id, None).unwrap();
            repo.tag_lightweight("v1.0.0", &object, false).unwrap();
        }
        {
            let commit = repo.find_commit(commit_id).unwrap();
            repo.branch("feature", &commit, false).unwrap();
        }
        (repo, commit_id)
    }

    #[test]
    fn empty_ref_resolves_to_head() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, commit_id) = test_repo(dir.path());
        assert_eq!(resolve_ref(&repo, "").unwrap(), commit_id);
    }

    #[test]
    fn ref_ladder_tries_branch_then_tag_then_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, commit_id) = test_repo(dir.path());

        assert_eq!(resolve_ref(&repo, "feature").unwrap(), commit_id);
        assert_eq!(resolve_ref(&repo, "v1.0.0").unwrap(), commit_id);

        let prefix: String = commit_id.to_string().chars().take(7).collect();
        assert_eq!(resolve_ref(&repo, &prefix).unwrap(), commit_id);
    }

    #[test]
    fn unknown_ref_falls_back_to_head() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, commit_id) = test_repo(dir.path());
        assert_eq!(resolve_ref(&repo, "no-such-ref").unwrap(), commit_id);
    }

    #[test]
    fn reads_default_filename_at_repo_root() {
        let dir = tempfile::tempdir().unwrap();
        let _ = test_repo(dir.path());
        let fetched = read_source_file(dir.path(), None, Language::Python).unwrap();
        assert_eq!(fetched.filename, "main.py");
        assert_eq!(fetched.bytes, b"def handler(e): return e");
    }

    #[test]
    fn missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let _ = test_repo(dir.path());
        let err = read_source_file(dir.path(), Some("nope/main.py"), Language::Python).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn traversal_path_is_rejected_before_clone() {
        let spec = GitSource {
            url: "https://github.com/acme/fns.git".to_string(),
            git_ref: None,
            path: Some("../../etc".to_string()),
            secret_ref: None,
        };
        let err = fetch(&spec, Language::Python, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationRejected);
    }

    #[tokio::test]
    async fn disallowed_scheme_is_rejected_before_clone() {
        let spec = GitSource {
            url: "file:///etc".to_string(),
            git_ref: None,
            path: None,
            secret_ref: None,
        };
        let err = fetch(&spec, Language::Python, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationRejected);
    }
}
