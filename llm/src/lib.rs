mod accumulator;
mod client_utils;
mod errors;
mod language_model;
pub mod llm_test;
mod openai_compat;
pub mod opentelemetry;
mod types;

pub use accumulator::StreamAccumulator;
pub use errors::{LanguageModelError, LanguageModelResult};
pub use language_model::{LanguageModel, LanguageModelStream};
pub use openai_compat::{OpenAICompatModel, OpenAICompatModelOptions};
pub use types::*;
