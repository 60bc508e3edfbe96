mod action;
mod answer;
mod cache;
mod config;
mod context;
mod errors;
mod evaluate;
mod events;
mod guardrail;
mod kv;
pub mod opentelemetry;
mod rate_limit;
mod rewrite;
mod run;
mod scrape;
mod search;
mod stream;
mod summarize;
pub mod testing;

pub use action::{Action, ActionType, QueryPlan};
pub use answer::Answerer;
pub use cache::ResultCache;
pub use config::AgentConfig;
pub use context::{
    ChatMessage, ChatRole, MessagePart, SearchHistoryEntry, SearchResult, SystemContext,
};
pub use errors::{AgentError, AgentResult};
pub use evaluate::Evaluator;
pub use events::{SearchStatus, Source, StepStatus, StreamEvent};
pub use guardrail::{Guardrail, GuardrailDecision};
pub use kv::{KvError, KvStore, MemoryKv};
pub use rate_limit::{RateLimitDecision, RateLimiter, RequestUser};
pub use rewrite::QueryRewriter;
pub use run::{OnFinish, RunSession, RunSessionParams};
pub use scrape::{BulkScrapeResult, HttpScraper, PageContent, ScrapeError, ScrapeOutcome, Scraper};
pub use search::{canonical_url, favicon_url, SearchError, SearchHit, SearchProvider, SerperSearch};
pub use stream::{EventWriter, ResumableStreams, StreamSubscription};
pub use summarize::{SummarizeRequest, Summarizer};
