//! Inline source: the code is carried verbatim in the spec.

use crate::models::{InlineSource, Language};
use crate::{OperatorError, Result};

use super::FetchedSource;

pub fn fetch(spec: &InlineSource, language: Language) -> Result<FetchedSource> {
    if spec.code.trim().is_empty() {
        return Err(OperatorError::ValidationRejected(
            "inline source code is empty".to_string(),
        ));
    }
    Ok(FetchedSource {
        bytes: spec.code.clone().into_bytes(),
        filename: language.source_filename().to_string(),
        language,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_follows_language() {
        let fetched = fetch(
            &InlineSource {
                code: "module.exports.handler = async (e) => e;".to_string(),
            },
            Language::Nodejs,
        )
        .unwrap();
        assert_eq!(fetched.filename, "index.js");
    }

    #[test]
    fn empty_code_is_rejected() {
        let err = fetch(
            &InlineSource {
                code: "  \n".to_string(),
            },
            Language::Python,
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationRejected);
    }
}
