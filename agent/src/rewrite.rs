use crate::{
    action::{decode_structured, QueryPlan},
    context::SystemContext,
    errors::AgentResult,
};
use deepsearch_llm::{
    LanguageModel, LanguageModelInput, Message, ResponseFormatJson, ResponseFormatOption,
};
use std::sync::Arc;

const REWRITE_SYSTEM_PROMPT: &str = "You are a research planner. Given a conversation, the \
evidence gathered so far, and the evaluator's latest feedback, produce a short plan and the \
web search queries for the next research pass.

Rules:
- Output JSON with fields `plan` (string) and `queries` (array of 3 to 5 strings).
- Queries must be self-contained web searches, not instructions.
- Prioritize the gaps named in the feedback; do not repeat searches whose results are already \
in the evidence.
- Prefer queries likely to surface current, authoritative sources.";

fn query_plan_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "plan": { "type": "string" },
            "queries": {
                "type": "array",
                "items": { "type": "string" },
                "minItems": QueryPlan::MIN_QUERIES,
                "maxItems": QueryPlan::MAX_QUERIES,
            },
        },
        "required": ["plan", "queries"],
        "additionalProperties": false,
    })
}

/// Produces the research plan and 3-5 search queries for one step.
pub struct QueryRewriter {
    model: Arc<dyn LanguageModel>,
}

impl QueryRewriter {
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn rewrite(&self, ctx: &SystemContext) -> AgentResult<QueryPlan> {
        let user_prompt = format!(
            "Conversation:\n{}\n\nLocation hints: {}\n\nEvidence gathered so far:\n{}\n\n\
Evaluator feedback from the last pass:\n{}",
            ctx.message_history_text(),
            ctx.location_hints(),
            ctx.search_history_text(),
            ctx.last_feedback(),
        );

        let response = self
            .model
            .generate(LanguageModelInput {
                system_prompt: Some(REWRITE_SYSTEM_PROMPT.to_string()),
                messages: vec![Message::user(user_prompt)],
                response_format: Some(ResponseFormatOption::Json(ResponseFormatJson {
                    name: "query_plan".to_string(),
                    schema: Some(query_plan_schema()),
                })),
                ..Default::default()
            })
            .await?;

        let plan: QueryPlan = decode_structured(&response.text, "rewriter")?;
        plan.validate()?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ChatMessage;
    use crate::errors::AgentError;
    use deepsearch_llm::llm_test::MockLanguageModel;

    fn ctx() -> SystemContext {
        SystemContext::new(vec![ChatMessage::user("what changed?")], String::new())
    }

    #[tokio::test]
    async fn parses_a_valid_plan() {
        let model = Arc::new(MockLanguageModel::new());
        model.enqueue_generate_text(
            r#"{"plan":"look things up","queries":["a","b","c","d"]}"#,
        );

        let plan = QueryRewriter::new(model).rewrite(&ctx()).await.unwrap();
        assert_eq!(plan.queries, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn rejects_too_few_queries() {
        let model = Arc::new(MockLanguageModel::new());
        model.enqueue_generate_text(r#"{"plan":"p","queries":["only one"]}"#);

        let result = QueryRewriter::new(model).rewrite(&ctx()).await;
        assert!(matches!(result, Err(AgentError::Planner(_))));
    }

    #[tokio::test]
    async fn prompt_carries_feedback_and_history() {
        let model = Arc::new(MockLanguageModel::new());
        model.enqueue_generate_text(r#"{"plan":"p","queries":["a","b","c"]}"#);

        let mut ctx = ctx();
        ctx.record_feedback("cover pricing");

        QueryRewriter::new(model.clone()).rewrite(&ctx).await.unwrap();

        let inputs = model.tracked_generate_inputs();
        let prompt = &inputs[0].messages[0].content;
        assert!(prompt.contains("cover pricing"));
        assert!(prompt.contains("what changed?"));
    }
}
