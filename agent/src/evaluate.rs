use crate::{
    action::{decode_structured, Action},
    context::SystemContext,
    errors::AgentResult,
};
use deepsearch_llm::{
    LanguageModel, LanguageModelInput, Message, ResponseFormatJson, ResponseFormatOption,
};
use std::sync::Arc;

const EVALUATE_SYSTEM_PROMPT: &str = "You decide whether the gathered evidence is sufficient \
to answer the user's question.

Choose `answer` only if every major component of the question is covered by sufficient, \
current evidence. Otherwise choose `continue` and describe in `feedback` exactly what is \
still missing so the next search pass can close the gap. On `answer`, use `feedback` for \
caveats the final answer should acknowledge.

Output JSON with fields `type` (\"continue\" or \"answer\"), `title` (short label), \
`reasoning` (why this decision), and `feedback`. All fields are mandatory.";

fn action_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "type": { "type": "string", "enum": ["continue", "answer"] },
            "title": { "type": "string" },
            "reasoning": { "type": "string" },
            "feedback": { "type": "string" },
        },
        "required": ["type", "title", "reasoning", "feedback"],
        "additionalProperties": false,
    })
}

/// Decides `continue` vs `answer` at the end of each step.
pub struct Evaluator {
    model: Arc<dyn LanguageModel>,
}

impl Evaluator {
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn evaluate(&self, ctx: &SystemContext) -> AgentResult<Action> {
        let user_prompt = format!(
            "Question and conversation:\n{}\n\nEvidence gathered over {} search pass(es):\n{}",
            ctx.message_history_text(),
            ctx.current_step() + 1,
            ctx.search_history_text(),
        );

        let response = self
            .model
            .generate(LanguageModelInput {
                system_prompt: Some(EVALUATE_SYSTEM_PROMPT.to_string()),
                messages: vec![Message::user(user_prompt)],
                response_format: Some(ResponseFormatOption::Json(ResponseFormatJson {
                    name: "action".to_string(),
                    schema: Some(action_schema()),
                })),
                ..Default::default()
            })
            .await?;

        let action: Action = decode_structured(&response.text, "evaluator")?;
        action.validate()?;
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::context::ChatMessage;
    use crate::errors::AgentError;
    use deepsearch_llm::llm_test::MockLanguageModel;

    fn ctx() -> SystemContext {
        SystemContext::new(vec![ChatMessage::user("question")], String::new())
    }

    #[tokio::test]
    async fn parses_an_answer_action() {
        let model = Arc::new(MockLanguageModel::new());
        model.enqueue_generate_text(
            r#"{"type":"answer","title":"Ready","reasoning":"Covered","feedback":"None"}"#,
        );

        let action = Evaluator::new(model).evaluate(&ctx()).await.unwrap();
        assert_eq!(action.action_type(), ActionType::Answer);
        assert_eq!(action.feedback(), "None");
    }

    #[tokio::test]
    async fn rejects_missing_fields() {
        let model = Arc::new(MockLanguageModel::new());
        model.enqueue_generate_text(
            r#"{"type":"continue","title":"More","reasoning":"Gaps","feedback":""}"#,
        );

        let result = Evaluator::new(model).evaluate(&ctx()).await;
        assert!(matches!(result, Err(AgentError::Planner(_))));
    }

    #[tokio::test]
    async fn rejects_unknown_action_type() {
        let model = Arc::new(MockLanguageModel::new());
        model.enqueue_generate_text(
            r#"{"type":"retry","title":"T","reasoning":"R","feedback":"F"}"#,
        );

        let result = Evaluator::new(model).evaluate(&ctx()).await;
        assert!(matches!(result, Err(AgentError::Planner(_))));
    }
}
