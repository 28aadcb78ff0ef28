//! Error types for download operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// AWS error codes that indicate a credential problem rather than a generic
/// request failure. These trigger the one-shot credential refresh inside the
/// credential-aware retry path.
pub const CREDENTIAL_ERROR_CODES: &[&str] = &[
    "ExpiredToken",
    "ExpiredTokenException",
    "InvalidToken",
    "InvalidIdentityToken",
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
];

/// Errors that can occur during download operations.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// I/O error during file operations.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Credential fetch rejected, malformed, or unreachable.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Error reported by the storage service, with the service error code
    /// when one was present in the response.
    #[error("storage error{}: {message}", code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Storage {
        code: Option<String>,
        message: String,
    },

    /// Downloaded content does not match the expected digest.
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Untrusted path would resolve outside the output directory.
    #[error("path traversal detected: {reason} (input: {path:?})")]
    PathTraversal { path: String, reason: String },

    /// All retry attempts have been exhausted.
    #[error("failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },

    /// Invalid user-supplied argument (filter pattern, size string, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DownloadError {
    /// Whether this error indicates an AWS credential problem.
    ///
    /// Missing local credential material surfaces as `Authentication` during
    /// client construction and never reaches retry classification, so only
    /// service-reported codes are checked here.
    pub fn is_credential_error(&self) -> bool {
        match self {
            DownloadError::Storage {
                code: Some(code), ..
            } => CREDENTIAL_ERROR_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// Whether this error is safe to retry.
    ///
    /// Storage-service errors are retryable as a class; the credential-aware
    /// retry path special-cases the credential codes before backoff applies.
    /// Anything else signals a programming or environment defect and
    /// propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Io(_)
                | DownloadError::Storage { .. }
                | DownloadError::ChecksumMismatch { .. }
        )
    }
}
