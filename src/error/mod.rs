//! Error types and handlers for registry operations
//!
//! Every failure in the crate is a [`RegistryError`]. Variants are grouped by
//! the kind of failure so callers can react without inspecting HTTP codes:
//! - transient network (`Network`, `Timeout`)
//! - protocol (`Protocol`, `Registry`, `NotV2Registry`)
//! - not found (`ManifestUnknown`, `BlobUnknown`, `TagUnknown`, `NameUnknown`)
//! - forbidden (`Unauthorized`, `Forbidden`)
//! - invalid input (`Validation`, `Parse`)
//! - integrity (`DigestMismatch`, `SizeMismatch`)
//! - local capacity (`Io`, `DirectoryNotEmpty`)

pub mod handlers;

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Distribution error code returned when a registry rejects a manifest schema
pub const CODE_MANIFEST_INVALID: &str = "MANIFEST_INVALID";

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Connection level failure; `temporary` marks connect/reset style errors
    #[error("network error: {message}")]
    Network { message: String, temporary: bool },

    #[error("request timed out: {0}")]
    Timeout(String),

    /// Unexpected HTTP status without a structured error body
    #[error("unexpected status {status}: {message}")]
    Protocol { status: u16, message: String },

    /// Structured distribution error body (`{"errors":[{"code":...}]}`)
    #[error("registry returned {status} {codes:?}: {message}")]
    Registry {
        status: u16,
        codes: Vec<String>,
        message: String,
    },

    #[error("{0} does not support the v2 registry API")]
    NotV2Registry(String),

    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    #[error("blob unknown: {0}")]
    BlobUnknown(String),

    #[error("tag unknown: {0}")]
    TagUnknown(String),

    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// Every image of a manifest list was excluded by the platform filter
    #[error("no image in {0} matched the platform filter")]
    AllImagesFiltered(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("content digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: String,
        expected: u64,
        actual: u64,
    },

    #[error("io error: {0}")]
    Io(String),

    #[error("directory {} is not empty", .0.display())]
    DirectoryNotEmpty(PathBuf),

    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Planning failures collected across all repositories of a run
    #[error("{} error(s) occurred while planning: {}", .0.len(), join_errors(.0))]
    Plan(Vec<RegistryError>),
}

fn join_errors(errs: &[RegistryError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl RegistryError {
    /// Whether retrying the same request may succeed.
    ///
    /// Digest mismatches are never temporary: a second fetch cannot repair
    /// tampered content.
    pub fn is_temporary(&self) -> bool {
        match self {
            RegistryError::Network { temporary, .. } => *temporary,
            RegistryError::Timeout(_) => true,
            RegistryError::Protocol { status, .. } | RegistryError::Registry { status, .. } => {
                matches!(status, 429 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::ManifestUnknown(_)
                | RegistryError::BlobUnknown(_)
                | RegistryError::TagUnknown(_)
                | RegistryError::NameUnknown(_)
        )
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            RegistryError::Unauthorized(_) | RegistryError::Forbidden(_)
        )
    }

    /// True when the registry reported the given distribution error code
    pub fn has_code(&self, code: &str) -> bool {
        match self {
            RegistryError::Registry { codes, .. } => codes.iter().any(|c| c == code),
            _ => false,
        }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        handlers::NetworkErrorHandler::handle_network_error(&err, "request")
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        RegistryError::Parse(format!("invalid url: {}", err))
    }
}

impl From<tokio::task::JoinError> for RegistryError {
    fn from(err: tokio::task::JoinError) -> Self {
        RegistryError::Io(format!("background task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_temporary_errors() {
        assert!(
            RegistryError::Network {
                message: "reset".into(),
                temporary: true
            }
            .is_temporary()
        );
        assert!(RegistryError::Timeout("slow".into()).is_temporary());
        assert!(
            RegistryError::Protocol {
                status: 503,
                message: String::new()
            }
            .is_temporary()
        );
        assert!(!RegistryError::ManifestUnknown("x".into()).is_temporary());
        assert!(
            !RegistryError::DigestMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .is_temporary()
        );
    }

    #[test]
    fn detects_registry_codes() {
        let err = RegistryError::Registry {
            status: 400,
            codes: vec![CODE_MANIFEST_INVALID.to_string()],
            message: "manifest invalid".into(),
        };
        assert!(err.has_code(CODE_MANIFEST_INVALID));
        assert!(!err.has_code("BLOB_UNKNOWN"));
    }

    #[test]
    fn plan_error_lists_every_failure() {
        let err = RegistryError::Plan(vec![
            RegistryError::TagUnknown("a/b:c".into()),
            RegistryError::ManifestUnknown("a/b@sha256:00".into()),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 error(s)"));
        assert!(text.contains("a/b:c"));
    }
}
