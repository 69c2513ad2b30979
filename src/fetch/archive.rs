//! # GitHub Archive Fetcher
//!
//! Downloads a repository zipball through the GitHub API and extracts the
//! first entry whose last path segment is the language's conventional
//! filename, optionally scoped to a subdirectory. GitHub prefixes every
//! entry with an `owner-repo-sha/` root directory, which is stripped before
//! matching.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use futures::StreamExt;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::StatusCode;

use crate::models::{GithubArchiveSource, Language};
use crate::{OperatorError, Result};

use super::{secrets, validate, FetchedSource, MAX_SOURCE_BYTES};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const OPERATOR_USER_AGENT: &str = "knative-lambda-operator";

pub async fn fetch(
    http: &reqwest::Client,
    spec: &GithubArchiveSource,
    language: Language,
    secret: Option<&BTreeMap<String, Vec<u8>>>,
) -> Result<FetchedSource> {
    validate::github_segment(&spec.owner)?;
    validate::github_segment(&spec.repo)?;
    if let Some(reference) = &spec.git_ref {
        validate::git_ref(reference)?;
    }
    if let Some(subpath) = &spec.subpath {
        validate::repo_path(subpath)?;
    }

    let reference = spec.git_ref.as_deref().filter(|r| !r.is_empty()).unwrap_or("HEAD");
    let url = format!(
        "https://api.github.com/repos/{}/{}/zipball/{}",
        spec.owner, spec.repo, reference
    );

    let mut request = http
        .get(&url)
        .header(ACCEPT, GITHUB_ACCEPT)
        .header(USER_AGENT, OPERATOR_USER_AGENT);
    if let Some(token) = secret.and_then(secrets::archive_token) {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| OperatorError::DownloadError(format!("zipball request: {e}")))?;

    match response.status() {
        StatusCode::NOT_FOUND => {
            return Err(OperatorError::NotFound(format!(
                "repository {}/{} at {}",
                spec.owner, spec.repo, reference
            )))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            return Err(OperatorError::AuthFailed(format!(
                "github refused access to {}/{}",
                spec.owner, spec.repo
            )))
        }
        status if !status.is_success() => {
            return Err(OperatorError::DownloadError(format!(
                "zipball download returned {status}"
            )))
        }
        _ => {}
    }

    // Stream the body with a hard cap; a zipball over the limit aborts
    // without buffering the rest.
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| OperatorError::DownloadError(format!("zipball body: {e}")))?;
        if (body.len() + chunk.len()) as u64 > MAX_SOURCE_BYTES {
            return Err(OperatorError::DownloadError(format!(
                "zipball exceeds the {MAX_SOURCE_BYTES} byte cap"
            )));
        }
        body.extend_from_slice(&chunk);
    }

    let bytes = extract_source(&body, language, spec.subpath.as_deref())?;
    Ok(FetchedSource {
        bytes,
        filename: language.source_filename().to_string(),
        language,
    })
}

/// Find and read the conventional source file inside a zipball.
pub(crate) fn extract_source(
    zip_bytes: &[u8],
    language: Language,
    subpath: Option<&str>,
) -> Result<Vec<u8>> {
    let wanted = language.source_filename();
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))
        .map_err(|e| OperatorError::ExtractError(format!("open zipball: {e}")))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| OperatorError::ExtractError(format!("read zip entry: {e}")))?;
        if !entry.is_file() {
            continue;
        }
        let name = entry.name().to_string();

        // Strip GitHub's `owner-repo-sha/` root prefix.
        let relative = match name.split_once('/') {
            Some((_, rest)) if !rest.is_empty() => rest,
            _ => continue,
        };

        if let Some(scope) = subpath {
            let scope = scope.trim_end_matches('/');
            if !(relative.starts_with(&format!("{scope}/")) || relative == scope) {
                continue;
            }
        }

        if relative.rsplit('/').next() == Some(wanted) {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| OperatorError::ExtractError(format!("read {name}: {e}")))?;
            return Ok(bytes);
        }
    }

    Err(OperatorError::ExtractError(format!(
        "no {wanted} found in archive{}",
        subpath.map(|s| format!(" under {s}")).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zipball(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, body) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn strips_github_root_prefix() {
        let bytes = zipball(&[
            ("acme-fns-8f4c1d2/README.md", "docs"),
            ("acme-fns-8f4c1d2/main.py", "def handler(e): return e"),
        ]);
        let source = extract_source(&bytes, Language::Python, None).unwrap();
        assert_eq!(source, b"def handler(e): return e");
    }

    #[test]
    fn subpath_scopes_the_search() {
        let bytes = zipball(&[
            ("acme-fns-8f4c1d2/main.py", "top = True"),
            ("acme-fns-8f4c1d2/app/main.py", "scoped = True"),
        ]);
        let source = extract_source(&bytes, Language::Python, Some("app")).unwrap();
        assert_eq!(source, b"scoped = True");
    }

    #[test]
    fn missing_conventional_file_is_extract_error() {
        let bytes = zipball(&[("acme-fns-8f4c1d2/README.md", "docs")]);
        let err = extract_source(&bytes, Language::Go, None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ExtractError);
    }

    #[test]
    fn corrupt_archive_is_extract_error() {
        let err = extract_source(b"not a zip", Language::Python, None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ExtractError);
    }
}
