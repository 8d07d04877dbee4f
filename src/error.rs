//! Failure taxonomy for one textraction invocation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TextractorError {
    #[error("failed to download <{uri}>: {reason}")]
    DownloadFailure { uri: String, reason: String },

    #[error("<{uri}> has unsupported extension \"{ext}\"")]
    UnsupportedFormat { uri: String, ext: String },

    #[error("extraction failed: {0}")]
    ExtractionFailure(String),

    #[error("failed to dispatch page {page}: {reason}")]
    DispatchFailure { page: u32, reason: String },

    /// Page results still outstanding when the wait budget ran out.
    #[error("timed out waiting for pages {pages:?}")]
    CollectionTimeout { pages: Vec<u32> },

    #[error("searchable output merge exceeded {secs:.1}s")]
    MergeTimeout { secs: f64 },

    #[error("failed to upload <{uri}>: {reason}")]
    UploadFailure { uri: String, reason: String },

    #[error("callback <{uri}> failed: {reason}")]
    CallbackFailure { uri: String, reason: String },
}

impl TextractorError {
    pub fn download(uri: &str, err: impl std::fmt::Display) -> Self {
        Self::DownloadFailure {
            uri: uri.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn upload(uri: &str, err: impl std::fmt::Display) -> Self {
        Self::UploadFailure {
            uri: uri.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn extraction(err: impl std::fmt::Display) -> Self {
        Self::ExtractionFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_format_message() {
        let err = TextractorError::UnsupportedFormat {
            uri: "mem://docs/a.xyz".to_string(),
            ext: ".xyz".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "<mem://docs/a.xyz> has unsupported extension \".xyz\""
        );
    }

    #[test]
    fn test_download_helper_keeps_reason() {
        let err = TextractorError::download("file:///tmp/x.pdf", "not found");
        assert!(err.to_string().contains("not found"));
        assert!(err.to_string().contains("file:///tmp/x.pdf"));
    }
}
