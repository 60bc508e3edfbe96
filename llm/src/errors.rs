use thiserror::Error;

#[derive(Error, Debug)]
pub enum LanguageModelError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// The request to the provider failed in transit or while reading the
    /// response body.
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The request returned a non-OK status code.
    #[error("HTTP status error: {0}: {1}")]
    StatusCode(reqwest::StatusCode, String),
    /// The response from the provider was unexpected (e.g. no choices in a
    /// completion).
    #[error("Invariant ({0}): {1}")]
    Invariant(&'static str, String),
    /// The model refused to process the input.
    #[error("Refusal: {0}")]
    Refusal(String),
}

impl LanguageModelError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::StatusCode(status, _) => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

pub type LanguageModelResult<T> = Result<T, LanguageModelError>;
