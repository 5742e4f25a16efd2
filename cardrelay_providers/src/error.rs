use thiserror::Error;

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response format: {0}")]
    Format(String),

    #[error("Rate limited by {0}")]
    RateLimited(String),
}

pub type Result<T> = std::result::Result<T, FallbackError>;

impl FallbackError {
    /// Rate limiting and malformed answers are not worth another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}
