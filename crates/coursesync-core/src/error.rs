use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server error: {0}")]
    Server(String),

    /// A 4xx other than 429: the request itself is wrong, e.g. a bad path.
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Local store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Failed to precache {url}: {reason}")]
    PrecacheFailure { url: String, reason: String },

    #[error("Offline cache worker is not running")]
    WorkerUnavailable,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl SyncError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            429 => SyncError::RateLimited,
            500..=599 => SyncError::Server(truncated),
            400..=499 => SyncError::Rejected(format!("Status {}: {}", status, truncated)),
            _ => SyncError::Server(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Failures expected to clear up on their own.
    ///
    /// Every read failure sends the read one tier down the fallback chain;
    /// the others are logged as errors because retrying will not fix them.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_)
                | SyncError::Transport(_)
                | SyncError::Server(_)
                | SyncError::RateLimited
                | SyncError::MalformedResponse(_)
                | SyncError::WorkerUnavailable
        )
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        SyncError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedResponse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_maps_rate_limit_and_server_errors() {
        assert!(matches!(
            SyncError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            SyncError::RateLimited
        ));
        assert!(matches!(
            SyncError::from_status(StatusCode::BAD_GATEWAY, "upstream down"),
            SyncError::Server(msg) if msg == "upstream down"
        ));
        let err = SyncError::from_status(StatusCode::NOT_FOUND, "missing");
        assert!(matches!(err, SyncError::Rejected(_)));
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_truncate_body_respects_limit() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 10);
        let truncated = SyncError::truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(truncated.contains("truncated"));
        assert_eq!(SyncError::truncate_body("short"), "short");
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Transport("refused".into()).is_transient());
        assert!(SyncError::MalformedResponse("bad json".into()).is_transient());
        assert!(!SyncError::StoreUnavailable("quota".into()).is_transient());
        assert!(!SyncError::from_status(StatusCode::NOT_FOUND, "").is_transient());
        assert!(SyncError::from_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(!SyncError::PrecacheFailure {
            url: "/".into(),
            reason: "404".into()
        }
        .is_transient());
    }
}
