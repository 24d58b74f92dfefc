use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Why a token refresh failed. `InvalidGrant` is permanent: the stored
/// refresh token is dead and the account must be re-authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    Network(String),
    InvalidGrant,
    RateLimited(String),
    BadResponse(String),
}

impl std::fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshFailure::Network(e) => write!(f, "network error: {e}"),
            RefreshFailure::InvalidGrant => write!(f, "invalid_grant: refresh token revoked"),
            RefreshFailure::RateLimited(e) => write!(f, "token endpoint rate limited: {e}"),
            RefreshFailure::BadResponse(e) => write!(f, "bad token response: {e}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("No accounts available")]
    NoCandidates,

    #[error("All accounts failed")]
    ExhaustedCandidates,

    #[error("Request body too large")]
    PayloadTooLarge,

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Upstream auth failed: {0}")]
    AuthFailed(String),

    #[error("Upstream error: {0}")]
    UpstreamTransient(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(RefreshFailure),

    #[error("Account {0} is not refreshable")]
    AccountNotRefreshable(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl ProxyError {
    /// True when retrying the same account may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamTransient(_)
                | ProxyError::NetworkError(_)
                | ProxyError::RefreshFailed(RefreshFailure::Network(_))
                | ProxyError::RefreshFailed(RefreshFailure::RateLimited(_))
        )
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ProxyError::InvalidApiKey => (StatusCode::UNAUTHORIZED, "authentication_error"),
            ProxyError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "invalid_request_error"),
            ProxyError::NoCandidates | ProxyError::ExhaustedCandidates => {
                (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error")
            }
            ProxyError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
            ProxyError::AuthFailed(_)
            | ProxyError::RefreshFailed(_)
            | ProxyError::AccountNotRefreshable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "api_error")
            }
            ProxyError::IoError(_) | ProxyError::DatabaseError(_) | ProxyError::ConfigError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "api_error")
            }
            ProxyError::UpstreamTransient(_)
            | ProxyError::NetworkError(_)
            | ProxyError::ParseError(_) => (StatusCode::BAD_GATEWAY, "api_error"),
        };

        (
            status,
            Json(json!({
                "type": "error",
                "error": {
                    "type": error_type,
                    "message": self.to_string()
                }
            })),
        )
            .into_response()
    }
}
