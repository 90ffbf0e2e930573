use thiserror::Error;

/// Gateway-wide error taxonomy. Every domain failure is mapped into one of
/// these variants before it reaches the wire; `code()` and `status()` define
/// the response envelope contract.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    InsufficientTokens(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Too many requests. Please slow down.")]
    RateLimited {
        limit: u32,
        window_seconds: u64,
        retry_after: i64,
    },

    /// Normalized provider failure. Upstream auth misconfiguration lands here
    /// too — the API caller never sees a 401 for an operator problem.
    #[error("{0}")]
    Llm(String),

    #[error("{0}")]
    LlmTimeout(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Stable UPPER_SNAKE code included in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::InsufficientTokens(_) => "INSUFFICIENT_TOKENS",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            ApiError::Llm(_) => "LLM_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
            ApiError::LlmTimeout(_) => "LLM_TIMEOUT",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::InsufficientTokens(_) => 402,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::RateLimited { .. } => 429,
            ApiError::Llm(_) | ApiError::Internal(_) => 500,
            ApiError::LlmTimeout(_) => 504,
        }
    }

    /// Structured details attached to the error body. Only client-class
    /// errors carry details by default; the envelope decides whether to
    /// include them for 5xx when debug is on.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::RateLimited {
                limit,
                window_seconds,
                retry_after,
            } => Some(serde_json::json!({
                "limit": limit,
                "window_seconds": window_seconds,
                "retry_after": retry_after,
            })),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_statuses() {
        let cases: Vec<(ApiError, &str, u16)> = vec![
            (ApiError::Validation("x".into()), "VALIDATION_ERROR", 400),
            (ApiError::Unauthorized("x".into()), "UNAUTHORIZED", 401),
            (
                ApiError::InsufficientTokens("x".into()),
                "INSUFFICIENT_TOKENS",
                402,
            ),
            (ApiError::Forbidden("x".into()), "FORBIDDEN", 403),
            (ApiError::NotFound("x".into()), "NOT_FOUND", 404),
            (ApiError::Llm("x".into()), "LLM_ERROR", 500),
            (ApiError::LlmTimeout("x".into()), "LLM_TIMEOUT", 504),
            (ApiError::Internal("x".into()), "INTERNAL_ERROR", 500),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status(), status);
        }
    }

    #[test]
    fn rate_limited_carries_details() {
        let err = ApiError::RateLimited {
            limit: 60,
            window_seconds: 60,
            retry_after: 1_700_000_000,
        };
        assert_eq!(err.status(), 429);
        let details = err.details().expect("details");
        assert_eq!(details["limit"], 60);
        assert_eq!(details["window_seconds"], 60);
    }
}
