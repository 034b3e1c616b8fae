use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited. Retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Selection session expired: {0}")]
    SelectionExpired(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl ApiError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ApiError::Auth(_) => "Your session has expired. Please sign in again.",
            ApiError::RateLimited { .. } => "Too many requests. Please wait a moment.",
            ApiError::Network(_) => "Network error. Check your connection.",
            ApiError::Validation(_) => "The selection was rejected. Please pick again.",
            ApiError::SelectionExpired(_) => {
                "The LinkedIn selection expired. Please connect your account again."
            }
            ApiError::Api(_) => "Server error. Please try again later.",
            ApiError::Timeout(_) => "Request timed out. Please try again.",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. } | ApiError::Network(_) | ApiError::Timeout(_)
        )
    }

    pub fn is_selection_expired(&self) -> bool {
        matches!(self, ApiError::SelectionExpired(_))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn map_error_text(msg: &str) -> ApiError {
    let lower = msg.to_lowercase();
    if lower.contains("selection session expired")
        || lower.contains("selection_expired")
        || lower.contains("selection expired")
    {
        ApiError::SelectionExpired(msg.to_string())
    } else if lower.contains("429") || lower.contains("rate_limit") || lower.contains("rate limit") {
        ApiError::RateLimited { retry_after: 60 }
    } else if lower.contains("401") || lower.contains("unauthorized") || lower.contains("token") {
        ApiError::Auth(msg.to_string())
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ApiError::Timeout(msg.to_string())
    } else if lower.contains("validation") || lower.contains("invalid") {
        ApiError::Validation(msg.to_string())
    } else {
        ApiError::Api(msg.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_expiry_text_maps_to_dedicated_variant() {
        let err = map_error_text("Selection session expired, please reconnect");
        assert!(err.is_selection_expired());
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_text_is_retryable() {
        let err = map_error_text("HTTP 429 Too Many Requests");
        assert!(matches!(err, ApiError::RateLimited { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn unknown_text_is_generic_api_error() {
        let err = map_error_text("organization not administered by user");
        assert!(matches!(err, ApiError::Api(_)));
        assert_eq!(err.user_message(), "Server error. Please try again later.");
    }
}
