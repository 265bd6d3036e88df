//! Standardized translation of HTTP and transport failures into [`RegistryError`]

use crate::error::RegistryError;
use reqwest::StatusCode;
use serde::Deserialize;

/// The kind of object a request was addressing, used to pick the not-found variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Manifest,
    Blob,
    Tag,
    Repository,
    Upload,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Standard error handler for HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Map a non-success registry response onto the error taxonomy.
    ///
    /// `subject` names what was requested (`repo@digest`, `repo:tag`) and ends
    /// up in the error message.
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        resource: Resource,
        subject: &str,
    ) -> RegistryError {
        let body: Option<ErrorBody> = serde_json::from_str(error_text).ok();
        let entries = body.map(|b| b.errors).unwrap_or_default();
        let codes: Vec<String> = entries.iter().map(|e| e.code.clone()).collect();
        let message = entries
            .iter()
            .map(|e| e.message.as_str())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        let has = |code: &str| codes.iter().any(|c| c == code);

        match status.as_u16() {
            401 => RegistryError::Unauthorized(subject.to_string()),
            403 => RegistryError::Forbidden(subject.to_string()),
            404 => {
                if has("MANIFEST_UNKNOWN") {
                    RegistryError::ManifestUnknown(subject.to_string())
                } else if has("BLOB_UNKNOWN") {
                    RegistryError::BlobUnknown(subject.to_string())
                } else if has("NAME_UNKNOWN") {
                    RegistryError::NameUnknown(subject.to_string())
                } else {
                    match resource {
                        Resource::Manifest => RegistryError::ManifestUnknown(subject.to_string()),
                        Resource::Blob => RegistryError::BlobUnknown(subject.to_string()),
                        Resource::Tag => RegistryError::TagUnknown(subject.to_string()),
                        Resource::Repository | Resource::Upload => {
                            RegistryError::NameUnknown(subject.to_string())
                        }
                    }
                }
            }
            code if !codes.is_empty() => RegistryError::Registry {
                status: code,
                codes,
                message: if message.is_empty() {
                    subject.to_string()
                } else {
                    format!("{}: {}", subject, message)
                },
            },
            code => RegistryError::Protocol {
                status: code,
                message: format!("{}: {}", subject, truncate(error_text, 256)),
            },
        }
    }

    /// Errors raised by the token endpoint
    pub fn handle_auth_error(status: StatusCode, error_text: &str, realm: &str) -> RegistryError {
        match status.as_u16() {
            401 => RegistryError::Unauthorized(format!("invalid credentials for {}", realm)),
            403 => RegistryError::Forbidden(format!("token request denied by {}", realm)),
            code => RegistryError::Protocol {
                status: code,
                message: format!(
                    "token request to {} failed: {}",
                    realm,
                    truncate(error_text, 256)
                ),
            },
        }
    }
}

/// Standard error handler for transport failures
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> RegistryError {
        if error.is_timeout() {
            RegistryError::Timeout(format!("{}: {}", context, error))
        } else if error.is_connect() || error.is_request() {
            RegistryError::Network {
                message: format!("{}: {}", context, error),
                temporary: true,
            }
        } else if error.is_decode() {
            RegistryError::Parse(format!("{}: {}", context, error))
        } else {
            RegistryError::Network {
                message: format!("{}: {}", context, error),
                temporary: false,
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_invalid_keeps_code() {
        let body = r#"{"errors":[{"code":"MANIFEST_INVALID","message":"manifest invalid"}]}"#;
        let err = HttpErrorHandler::handle_registry_error(
            StatusCode::BAD_REQUEST,
            body,
            Resource::Manifest,
            "demo:latest",
        );
        assert!(err.has_code(crate::error::CODE_MANIFEST_INVALID));
    }

    #[test]
    fn not_found_uses_body_code_before_resource() {
        let body = r#"{"errors":[{"code":"NAME_UNKNOWN","message":"repository name not known"}]}"#;
        let err = HttpErrorHandler::handle_registry_error(
            StatusCode::NOT_FOUND,
            body,
            Resource::Manifest,
            "missing/repo",
        );
        assert!(matches!(err, RegistryError::NameUnknown(_)));

        let err = HttpErrorHandler::handle_registry_error(
            StatusCode::NOT_FOUND,
            "",
            Resource::Tag,
            "demo:missing",
        );
        assert!(matches!(err, RegistryError::TagUnknown(_)));
    }

    #[test]
    fn unstructured_bodies_become_protocol_errors() {
        let err = HttpErrorHandler::handle_registry_error(
            StatusCode::BAD_GATEWAY,
            "<html>bad gateway</html>",
            Resource::Blob,
            "demo@sha256:00",
        );
        assert!(matches!(err, RegistryError::Protocol { status: 502, .. }));
        assert!(err.is_temporary());
    }
}
