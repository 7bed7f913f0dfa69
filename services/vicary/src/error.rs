//! Error types for the gateway

use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::digest::Digest;
use crate::token::BearerChallenge;

/// Result type for gateway operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for gateway operations
///
/// Errors are cloneable so that one fetch outcome can be handed to every
/// request waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Repository name or reference is malformed
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// The client must authenticate with the gateway first
    #[error("authentication required")]
    Unauthorized(BearerChallenge),

    /// The upstream refused the request or the token exchange
    #[error("upstream {upstream} denied access: {reason}")]
    UpstreamUnauthorized {
        /// Upstream id
        upstream: String,
        /// What the upstream said
        reason: String,
    },

    /// Manifest not found
    #[error("manifest unknown: {0}")]
    ManifestNotFound(String),

    /// Blob not found
    #[error("blob unknown: {0}")]
    BlobNotFound(String),

    /// The upstream could not be reached or failed
    #[error("upstream {upstream} unavailable: {reason}")]
    UpstreamUnavailable {
        /// Upstream id
        upstream: String,
        /// What went wrong
        reason: String,
    },

    /// The upstream did not answer in time
    #[error("upstream {0} timed out")]
    UpstreamTimeout(String),

    /// Fetched content does not hash to the requested digest
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Requested digest
        expected: Digest,
        /// Digest of the bytes received
        actual: Digest,
    },

    /// The upstream returned an unusable manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(Arc<storage::StorageError>),

    /// The task producing a shared result stopped without one
    #[error("fetch abandoned before completion")]
    Abandoned,
}

impl From<storage::StorageError> for RegistryError {
    fn from(error: storage::StorageError) -> Self {
        RegistryError::Storage(Arc::new(error))
    }
}

impl From<echocache::RecvError> for RegistryError {
    fn from(_: echocache::RecvError) -> Self {
        RegistryError::Abandoned
    }
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::InvalidReference(_) | RegistryError::InvalidDigest(_) => {
                StatusCode::BAD_REQUEST
            }
            RegistryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RegistryError::UpstreamUnauthorized { .. } => StatusCode::FORBIDDEN,
            RegistryError::ManifestNotFound(_) | RegistryError::BlobNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RegistryError::UpstreamUnavailable { .. }
            | RegistryError::DigestMismatch { .. }
            | RegistryError::InvalidManifest(_) => StatusCode::BAD_GATEWAY,
            RegistryError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RegistryError::Storage(_) | RegistryError::Abandoned => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::InvalidReference(_) => "NAME_INVALID",
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::Unauthorized(_) => "UNAUTHORIZED",
            RegistryError::UpstreamUnauthorized { .. } => "DENIED",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::UpstreamUnavailable { .. } | RegistryError::UpstreamTimeout(_) => {
                "UNAVAILABLE"
            }
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::Storage(_) | RegistryError::Abandoned => "UNKNOWN",
        }
    }

    /// True for the errors which mean "no such artifact".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::ManifestNotFound(_) | RegistryError::BlobNotFound(_)
        )
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::warn!(%status, code, "{message}");
        } else {
            tracing::debug!(%status, code, "{message}");
        }

        let challenge = match &self {
            RegistryError::Unauthorized(challenge) => challenge.to_header_value(),
            _ => None,
        };

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(challenge) = challenge {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, challenge);
        }
        response
    }
}

/// Response header carrying the digest of the returned content
pub(crate) fn docker_content_digest(digest: &Digest) -> (header::HeaderName, HeaderValue) {
    let value = HeaderValue::from_str(&digest.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static(""));
    (
        header::HeaderName::from_static("docker-content-digest"),
        value,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(RegistryError: Clone, Send, Sync);

    #[tokio::test]
    async fn unauthorized_carries_challenge() {
        let challenge = BearerChallenge::new("http://localhost:5000/token", "localhost:5000")
            .with_scope("repository:library/python:pull");
        let response = RegistryError::Unauthorized(challenge).into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let header = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
        assert_eq!(
            header,
            r#"Bearer realm="http://localhost:5000/token",service="localhost:5000",scope="repository:library/python:pull""#
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errors"][0]["code"], "UNAUTHORIZED");
    }

    #[test]
    fn upstream_failures_map_to_gateway_statuses() {
        let unavailable = RegistryError::UpstreamUnavailable {
            upstream: "docker.io".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(unavailable.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            RegistryError::UpstreamTimeout("docker.io".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );

        let mismatch = RegistryError::DigestMismatch {
            expected: Digest::sha256_of(b"expected"),
            actual: Digest::sha256_of(b"actual"),
        };
        assert_eq!(mismatch.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(mismatch.error_code(), "DIGEST_INVALID");
    }
}
