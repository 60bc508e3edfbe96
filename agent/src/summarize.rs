use crate::cache::ResultCache;
use deepsearch_llm::{LanguageModel, LanguageModelInput, Message};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

const SUMMARY_SYSTEM_PROMPT: &str = "You are a research assistant distilling one web page \
into a synthesis relevant to the user's query.

Rules:
- Write a compact narrative synthesis of the page content as it bears on the query.
- Preserve original units, dates, figures, named entities, and other contextual anchors exactly.
- Use only information present in the page content. Outside knowledge is forbidden.
- If the page does not address the query, say what the page covers instead.";

/// Everything that determines one summary. The cache key is derived from the
/// full request, conversation included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeRequest {
    pub query: String,
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub scraped_content: String,
    pub conversation: String,
}

/// Distills one scraped page into a query-relevant synthesis. Never fails:
/// an empty page or an LLM error falls back to the search snippet.
pub struct Summarizer {
    model: Arc<dyn LanguageModel>,
    cache: ResultCache,
}

impl Summarizer {
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>, cache: ResultCache) -> Self {
        Self { model, cache }
    }

    pub async fn summarize(&self, request: &SummarizeRequest) -> String {
        if request.scraped_content.trim().is_empty() {
            return request.snippet.clone();
        }

        let result = self
            .cache
            .get_or_invoke("summary", request, || self.call_model(request))
            .await;

        match result {
            Ok(summary) => summary,
            Err(error) => {
                warn!(url = %request.url, %error, "summarization failed, using snippet");
                request.snippet.clone()
            }
        }
    }

    async fn call_model(
        &self,
        request: &SummarizeRequest,
    ) -> Result<String, deepsearch_llm::LanguageModelError> {
        let user_prompt = format!(
            "Query: {}\n\nConversation so far:\n{}\n\nPage: {} ({})\nSnippet: {}\n\nPage content:\n{}",
            request.query,
            request.conversation,
            request.title,
            request.url,
            request.snippet,
            request.scraped_content,
        );

        let response = self
            .model
            .generate(LanguageModelInput {
                system_prompt: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
                messages: vec![Message::user(user_prompt)],
                ..Default::default()
            })
            .await?;

        Ok(response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use deepsearch_llm::llm_test::MockLanguageModel;
    use std::time::Duration;

    fn request(content: &str) -> SummarizeRequest {
        SummarizeRequest {
            query: "q".to_string(),
            url: "https://a.example".to_string(),
            title: "Title".to_string(),
            snippet: "The snippet".to_string(),
            scraped_content: content.to_string(),
            conversation: String::new(),
        }
    }

    fn summarizer(model: Arc<MockLanguageModel>) -> Summarizer {
        Summarizer::new(
            model,
            ResultCache::new(Arc::new(MemoryKv::new()), Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn empty_content_returns_snippet_without_llm_call() {
        let model = Arc::new(MockLanguageModel::new());
        let summarizer = summarizer(model.clone());

        assert_eq!(summarizer.summarize(&request("   ")).await, "The snippet");
        assert!(model.tracked_generate_inputs().is_empty());
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_snippet() {
        let model = Arc::new(MockLanguageModel::new());
        // Nothing enqueued: the mock errors out.
        let summarizer = summarizer(model);

        assert_eq!(
            summarizer.summarize(&request("page text")).await,
            "The snippet"
        );
    }

    #[tokio::test]
    async fn identical_requests_hit_the_cache() {
        let model = Arc::new(MockLanguageModel::new());
        model.enqueue_generate_text("The synthesis");
        let summarizer = summarizer(model.clone());

        let first = summarizer.summarize(&request("page text")).await;
        let second = summarizer.summarize(&request("page text")).await;

        assert_eq!(first, "The synthesis");
        assert_eq!(second, first);
        assert_eq!(model.tracked_generate_inputs().len(), 1);
    }
}
