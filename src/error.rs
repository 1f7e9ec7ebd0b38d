//! Error taxonomy and the mapping from internal failures to HTTP outcomes.
//!
//! Outward bodies are fixed, category-level messages plus the correlation id.
//! Internal detail (backend error text, config specifics) stays on the span
//! and in the logs; it is never echoed to the caller and never includes any
//! fragment of user-submitted content.

use axum::http::StatusCode;
use serde::Serialize;

use crate::auth::AuthError;
use crate::completion::CompletionError;
use crate::correlation::CorrelationId;

/// Every way a request can fail, one variant per phase-level failure class.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Bad input shape or length. The message is one of a fixed set of
    /// validation strings and is safe to return to the caller.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A required setting is absent or a client could not be initialised.
    /// Logged as a configuration problem, distinct from runtime errors.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The completion backend failed. Retrieval failures never surface
    /// here; they are absorbed to an empty result inside the retrieval
    /// client.
    #[error(transparent)]
    Completion(#[from] CompletionError),

    /// Anything uncategorised. Full detail goes on the span only.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// JSON body shared by all error responses.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub correlation_id: CorrelationId,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(AuthError::MissingToken) => StatusCode::UNAUTHORIZED,
            GatewayError::Auth(AuthError::InvalidToken) => StatusCode::UNAUTHORIZED,
            GatewayError::Auth(AuthError::Misconfigured(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Completion(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short stable label used for error counters and span attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::Auth(AuthError::Misconfigured(_)) => "configuration",
            GatewayError::Auth(_) => "auth",
            GatewayError::Configuration(_) => "configuration",
            GatewayError::Completion(_) => "upstream",
            GatewayError::Unexpected(_) => "internal",
        }
    }

    /// Build the outward body. Category-level text only.
    pub fn body(&self, correlation_id: &CorrelationId) -> ErrorBody {
        let (error, message) = match self {
            GatewayError::Validation(msg) => ("Bad Request", msg.clone()),
            GatewayError::Auth(AuthError::MissingToken) => (
                "Unauthorized",
                "Missing or invalid authorization token".to_string(),
            ),
            GatewayError::Auth(AuthError::InvalidToken) => {
                ("Unauthorized", "Invalid authorization token".to_string())
            }
            GatewayError::Auth(AuthError::Misconfigured(_)) | GatewayError::Configuration(_) => (
                "Service Configuration Error",
                "Service is not properly configured".to_string(),
            ),
            GatewayError::Completion(_) | GatewayError::Unexpected(_) => (
                "Internal Server Error",
                "An unexpected error occurred".to_string(),
            ),
        };
        ErrorBody {
            error,
            message,
            correlation_id: correlation_id.clone(),
        }
    }
}
