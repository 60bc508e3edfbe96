use crate::rate_limit::RateLimitDecision;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// A rate limiter denied the request before the loop started.
    #[error("Request denied by rate limiter")]
    Admission(RateLimitDecision),
    #[error("Language model error: {0}")]
    LanguageModel(#[from] deepsearch_llm::LanguageModelError),
    #[error("Search error: {0}")]
    Search(#[from] crate::search::SearchError),
    #[error("Scrape error: {0}")]
    Scrape(#[from] crate::scrape::ScrapeError),
    /// The rewriter or evaluator returned output that violates its schema.
    #[error("Planner error: {0}")]
    Planner(String),
    #[error("Storage error: {0}")]
    Storage(String),
    /// The client disconnected or the request deadline passed.
    #[error("Request cancelled")]
    Cancelled,
    #[error("Invariant: {0}")]
    Invariant(String),
}

impl AgentError {
    /// Short, stable message safe to surface to the client.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::Admission(_) => "rate limit exceeded",
            Self::LanguageModel(_) => "language model unavailable",
            Self::Search(_) => "search provider unavailable",
            Self::Scrape(_) => "page fetch failed",
            Self::Planner(_) => "planning failed",
            Self::Storage(_) => "storage unavailable",
            Self::Cancelled => "cancelled",
            Self::Invariant(_) => "internal error",
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
