use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// No response was received: DNS, refused connection, timeout, offline.
    #[error("Network error: {0}")]
    Network(String),

    /// The service answered with a failure status.
    #[error("{message}")]
    Remote { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// How the retry queue treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry later; the item stays queued unmodified
    Network,
    /// The service rejected the action; the item is annotated and blocks
    Logical,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error text fragments that mean the transport failed rather than the
/// service rejecting the request. Matched case-insensitively.
const TRANSPORT_FAILURE_PATTERNS: &[&str] = &[
    "failed to fetch",
    "network error",
    "network request failed",
    "networkerror",
    "timed out",
    "timeout",
    "offline",
    "connection refused",
    "connection reset",
    "connection closed",
    "unreachable",
    "dns error",
];

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let cut = body
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_ERROR_BODY_LENGTH)
            .last()
            .unwrap_or(0);
        format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
    }

    /// Pull a human-readable message out of a structured error body:
    /// `{"error": "..."}`, `{"message": "..."}` or `{"error": {"message": "..."}}`.
    fn structured_message(body: &str) -> Option<String> {
        let value: Value = serde_json::from_str(body).ok()?;
        let message = match value.get("error") {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(Value::Object(inner)) => inner.get("message").and_then(Value::as_str),
            _ => None,
        }
        .or_else(|| value.get("message").and_then(Value::as_str))?;

        let message = message.trim();
        if message.is_empty() {
            None
        } else {
            Some(Self::truncate_body(message))
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let message = Self::structured_message(body).unwrap_or_else(|| {
            let reason = reqwest::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("Request failed");
            format!("HTTP {} {}", status, reason)
        });
        ApiError::Remote { status, message }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401))
    }

    /// Decide whether a failure is worth retrying. Anything that happened
    /// while offline, any transport failure, and any message that reads like
    /// one is a network failure; everything else is logical.
    pub fn classify(&self, online: bool) -> FailureKind {
        if !online || matches!(self, ApiError::Network(_)) {
            return FailureKind::Network;
        }
        let text = self.to_string().to_lowercase();
        if TRANSPORT_FAILURE_PATTERNS.iter().any(|p| text.contains(p)) {
            FailureKind::Network
        } else {
            FailureKind::Logical
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}
