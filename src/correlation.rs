//! Per-request correlation identifiers.
//!
//! A correlation id is generated before any other work on a request and is
//! threaded through every span, log line, response body and the
//! `X-Correlation-ID` header so a support engineer can join the pieces
//! without ever needing the request content.

use serde::Serialize;
use std::fmt;

/// Opaque per-request identifier. Immutable once created; lives for the
/// lifetime of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh unique id (uuid v4).
    pub fn generate() -> Self {
        CorrelationId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
