//! # Build Context Fabricator
//!
//! Assembles the deterministic build context for a function: renders the
//! language's Dockerfile and runtime wrapper, computes the content hash over
//! `source || dockerfile || wrapper` (the feed order is part of the
//! contract), and packs everything into a gzipped tar with fixed entry
//! order, mode 0644 and zeroed timestamps so identical inputs produce
//! identical archives across process restarts.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use tera::{Context as TemplateContext, Tera};
use tracing::info;

use crate::config::BuildConfig;
use crate::models::{build::image_tag_for, Language, RuntimeSpec};
use crate::{OperatorError, Result};

/// Fallback entry point substituted when the user handler fails validation.
pub const SAFE_DEFAULT_HANDLER: &str = "handler";

const REQUIREMENTS_STUB: &str = include_str!("templates/requirements.txt");

lazy_static! {
    static ref TEMPLATES: Tera = {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (
                "dockerfile.python",
                include_str!("templates/dockerfile.python.tera"),
            ),
            (
                "dockerfile.nodejs",
                include_str!("templates/dockerfile.nodejs.tera"),
            ),
            ("dockerfile.go", include_str!("templates/dockerfile.go.tera")),
            ("runtime.py", include_str!("templates/runtime.py.tera")),
            ("runtime.js", include_str!("templates/runtime.js.tera")),
            ("package.json", include_str!("templates/package.json.tera")),
        ])
        .expect("embedded context templates parse");
        tera
    };
    /// Plain identifier: Python and Go handlers.
    static ref HANDLER_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    /// Node also accepts a single-dot `module.export` form.
    static ref NODE_HANDLER_RE: Regex =
        Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*(\.[A-Za-z_$][A-Za-z0-9_$]*)?$").unwrap();
}

/// The fabricated context, pre- and post-archive.
#[derive(Debug, Clone)]
pub struct FabricatedContext {
    /// SHA-256 over `source || dockerfile || wrapper`, hex-encoded.
    pub content_hash: String,
    /// First 12 hex chars of the hash; the image identity.
    pub image_tag: String,
    /// The gzipped tar consumed by the builder.
    pub archive: Vec<u8>,
}

/// Renders templates and packs archives for one operator configuration.
pub struct ContextFabricator {
    build: BuildConfig,
}

impl ContextFabricator {
    pub fn new(build: BuildConfig) -> Self {
        Self { build }
    }

    /// Fabricate the context for a function's fetched source.
    pub fn fabricate(
        &self,
        name: &str,
        namespace: &str,
        runtime: &RuntimeSpec,
        source: &[u8],
    ) -> Result<FabricatedContext> {
        let handler = sanitized_handler(runtime.language, &runtime.handler);
        if handler != runtime.handler {
            info!(
                function = name,
                namespace,
                "handler {:?} failed validation, using {:?}",
                runtime.handler,
                handler
            );
        }

        let params = self.render_params(name, namespace, runtime, &handler);
        let dockerfile = self.render_dockerfile(runtime.language, &params)?;
        let wrapper = render_wrapper(runtime.language, &params)?;

        let content_hash = content_hash(source, &dockerfile, wrapper.as_deref());
        let image_tag = image_tag_for(&content_hash);
        let archive = pack_archive(runtime.language, source, &dockerfile, wrapper.as_deref(), &params)?;

        Ok(FabricatedContext {
            content_hash,
            image_tag,
            archive,
        })
    }

    fn render_params(
        &self,
        name: &str,
        namespace: &str,
        runtime: &RuntimeSpec,
        handler: &str,
    ) -> TemplateContext {
        let base_image = match runtime.language {
            Language::Python => &self.build.python_base_image,
            Language::Nodejs => &self.build.nodejs_base_image,
            Language::Go => &self.build.go_base_image,
        };
        let mut params = TemplateContext::new();
        params.insert("base_image", base_image);
        params.insert("alpine_image", &self.build.alpine_image);
        params.insert(
            "runtime_version",
            runtime.version.as_deref().unwrap_or_default(),
        );
        params.insert("handler", handler);
        params.insert("function_name", name);
        params.insert("function_namespace", namespace);
        params.insert("timeout_seconds", &runtime.timeout_seconds);
        params
    }

    fn render_dockerfile(&self, language: Language, params: &TemplateContext) -> Result<Vec<u8>> {
        let template = match language {
            Language::Python => "dockerfile.python",
            Language::Nodejs => "dockerfile.nodejs",
            Language::Go => "dockerfile.go",
        };
        let rendered = TEMPLATES.render(template, params).map_err(|e| {
            OperatorError::DockerfileGenError(format!("render {template}: {e}"))
        })?;
        Ok(rendered.into_bytes())
    }
}

/// Validate the handler against the language's identifier pattern; invalid
/// input downgrades to the safe default rather than failing the build.
pub fn sanitized_handler(language: Language, raw: &str) -> String {
    let valid = match language {
        Language::Nodejs => NODE_HANDLER_RE.is_match(raw),
        Language::Python | Language::Go => HANDLER_RE.is_match(raw),
    };
    if valid {
        raw.to_string()
    } else {
        SAFE_DEFAULT_HANDLER.to_string()
    }
}

/// Render the runtime wrapper; Go has none (the built binary is the entry
/// point).
fn render_wrapper(language: Language, params: &TemplateContext) -> Result<Option<Vec<u8>>> {
    let template = match language {
        Language::Python => "runtime.py",
        Language::Nodejs => "runtime.js",
        Language::Go => return Ok(None),
    };
    let rendered = TEMPLATES
        .render(template, params)
        .map_err(|e| OperatorError::DockerfileGenError(format!("render {template}: {e}")))?;
    Ok(Some(rendered.into_bytes()))
}

/// SHA-256 over the ordered feed `source || dockerfile || wrapper`.
///
/// The order is contractual: a map-based feed that reordered the bytes would
/// silently change every image tag.
pub fn content_hash(source: &[u8], dockerfile: &[u8], wrapper: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source);
    hasher.update(dockerfile);
    if let Some(wrapper) = wrapper {
        hasher.update(wrapper);
    }
    hex::encode(hasher.finalize())
}

fn tar_header(size: usize) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    header
}

/// Pack the context archive: `Dockerfile`, the language source file, the
/// wrapper, then the language aux file, in that order.
fn pack_archive(
    language: Language,
    source: &[u8],
    dockerfile: &[u8],
    wrapper: Option<&[u8]>,
    params: &TemplateContext,
) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut append = |name: &str, bytes: &[u8]| -> Result<()> {
        let mut header = tar_header(bytes.len());
        builder
            .append_data(&mut header, name, bytes)
            .map_err(|e| OperatorError::Internal(format!("tar {name}: {e}")))?;
        Ok(())
    };

    append("Dockerfile", dockerfile)?;
    append(language.source_filename(), source)?;
    match language {
        Language::Python => {
            if let Some(wrapper) = wrapper {
                append("runtime.py", wrapper)?;
            }
            append("requirements.txt", REQUIREMENTS_STUB.as_bytes())?;
        }
        Language::Nodejs => {
            if let Some(wrapper) = wrapper {
                append("runtime.js", wrapper)?;
            }
            let package_json = TEMPLATES
                .render("package.json", params)
                .map_err(|e| OperatorError::DockerfileGenError(format!("render package.json: {e}")))?;
            append("package.json", package_json.as_bytes())?;
        }
        Language::Go => {}
    }

    let tar_bytes = builder
        .into_inner()
        .map_err(|e| OperatorError::Internal(format!("finish tar: {e}")))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&tar_bytes)
        .map_err(|e| OperatorError::Internal(format!("gzip context: {e}")))?;
    encoder
        .finish()
        .map_err(|e| OperatorError::Internal(format!("finish gzip: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn runtime(language: Language, handler: &str) -> RuntimeSpec {
        RuntimeSpec {
            language,
            version: Some("3.11".to_string()),
            handler: handler.to_string(),
            resources: None,
            env: None,
            timeout_seconds: 60,
        }
    }

    fn fabricator() -> ContextFabricator {
        ContextFabricator::new(BuildConfig::default())
    }

    fn archive_entries(archive: &[u8]) -> Vec<String> {
        let mut tar_bytes = Vec::new();
        GzDecoder::new(archive).read_to_end(&mut tar_bytes).unwrap();
        let mut entries = Vec::new();
        let mut reader = tar::Archive::new(tar_bytes.as_slice());
        for entry in reader.entries().unwrap() {
            let entry = entry.unwrap();
            entries.push(entry.path().unwrap().to_string_lossy().to_string());
            assert_eq!(entry.header().mode().unwrap(), 0o644);
        }
        entries
    }

    #[test]
    fn python_archive_has_fixed_entry_order() {
        let context = fabricator()
            .fabricate(
                "echo",
                "default",
                &runtime(Language::Python, "handler"),
                b"def handler(e): return e",
            )
            .unwrap();
        assert_eq!(
            archive_entries(&context.archive),
            vec!["Dockerfile", "main.py", "runtime.py", "requirements.txt"]
        );
    }

    #[test]
    fn nodejs_archive_carries_package_json() {
        let context = fabricator()
            .fabricate(
                "echo",
                "default",
                &runtime(Language::Nodejs, "handler"),
                b"module.exports.handler = async (e) => e;",
            )
            .unwrap();
        assert_eq!(
            archive_entries(&context.archive),
            vec!["Dockerfile", "index.js", "runtime.js", "package.json"]
        );
    }

    #[test]
    fn go_archive_has_no_wrapper() {
        let context = fabricator()
            .fabricate(
                "echo",
                "default",
                &runtime(Language::Go, "Handler"),
                b"package main\nfunc main() {}\n",
            )
            .unwrap();
        assert_eq!(archive_entries(&context.archive), vec!["Dockerfile", "main.go"]);
    }

    #[test]
    fn image_tag_is_twelve_hex_chars_of_the_hash() {
        let context = fabricator()
            .fabricate(
                "echo",
                "default",
                &runtime(Language::Python, "handler"),
                b"def handler(e): return e",
            )
            .unwrap();
        assert_eq!(context.image_tag.len(), 12);
        assert_eq!(context.image_tag, context.content_hash[..12]);
        assert!(context.image_tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_inputs_hash_identically() {
        let first = fabricator()
            .fabricate(
                "echo",
                "default",
                &runtime(Language::Python, "handler"),
                b"def handler(e): return e",
            )
            .unwrap();
        let second = fabricator()
            .fabricate(
                "echo",
                "default",
                &runtime(Language::Python, "handler"),
                b"def handler(e): return e",
            )
            .unwrap();
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.archive, second.archive);
    }

    #[test]
    fn source_change_changes_the_hash() {
        let runtime = runtime(Language::Python, "handler");
        let first = fabricator()
            .fabricate("echo", "default", &runtime, b"def handler(e): return e")
            .unwrap();
        let second = fabricator()
            .fabricate("echo", "default", &runtime, b"def handler(e): return 1")
            .unwrap();
        assert_ne!(first.content_hash, second.content_hash);
    }

    #[test]
    fn hash_feed_order_is_source_dockerfile_wrapper() {
        let source = b"s";
        let dockerfile = b"d";
        let wrapper = b"w";
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(b"sdw");
            hex::encode(hasher.finalize())
        };
        assert_eq!(content_hash(source, dockerfile, Some(wrapper)), expected);
        assert_ne!(
            content_hash(wrapper, dockerfile, Some(source)),
            content_hash(source, dockerfile, Some(wrapper))
        );
    }

    #[test]
    fn injection_handler_downgrades_to_safe_default() {
        assert_eq!(
            sanitized_handler(Language::Nodejs, "module.exports; process.exit()"),
            SAFE_DEFAULT_HANDLER
        );
        assert_eq!(
            sanitized_handler(Language::Python, "handler; import os"),
            SAFE_DEFAULT_HANDLER
        );
    }

    #[test]
    fn valid_handlers_pass_through() {
        assert_eq!(sanitized_handler(Language::Python, "handler"), "handler");
        assert_eq!(sanitized_handler(Language::Go, "Handle_Event2"), "Handle_Event2");
        assert_eq!(
            sanitized_handler(Language::Nodejs, "module.handler"),
            "module.handler"
        );
    }

    #[test]
    fn sanitization_is_idempotent() {
        let once = sanitized_handler(Language::Nodejs, "module.exports; process.exit()");
        assert_eq!(sanitized_handler(Language::Nodejs, &once), once);
    }

    #[test]
    fn rendered_dockerfile_mentions_handler_and_base_image() {
        let fab = fabricator();
        let params = fab.render_params(
            "echo",
            "default",
            &runtime(Language::Python, "handler"),
            "handler",
        );
        let dockerfile = fab.render_dockerfile(Language::Python, &params).unwrap();
        let text = String::from_utf8(dockerfile).unwrap();
        assert!(text.contains("FROM python:3.11-slim"));
        assert!(text.contains("LAMBDA_HANDLER=handler"));
        assert!(text.contains("CMD [\"python\", \"runtime.py\"]"));
    }
}
