use crate::{action::decode_structured, context::SystemContext};
use deepsearch_llm::{
    LanguageModel, LanguageModelInput, Message, ResponseFormatJson, ResponseFormatOption,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

const GUARDRAIL_SYSTEM_PROMPT: &str = "You are a safety classifier for a web research \
assistant. Given the conversation, decide whether the assistant should research and answer \
the latest request.

Refuse only requests seeking help with clearly harmful activity (weapons, malware, fraud, \
targeted harassment, and similar). Ordinary controversial or sensitive topics are allowed.

Output JSON with fields `classification` (\"allow\" or \"refuse\") and, when refusing, a \
short `reason`.";

fn classification_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "classification": { "type": "string", "enum": ["allow", "refuse"] },
            "reason": { "type": "string" },
        },
        "required": ["classification"],
        "additionalProperties": false,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Refuse { reason: String },
}

#[derive(Debug, Deserialize)]
struct Classification {
    classification: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Pre-loop classifier gating the agent loop. Classifier failures fail open:
/// losing the guardrail must not take the product down.
pub struct Guardrail {
    model: Arc<dyn LanguageModel>,
}

impl Guardrail {
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn classify(&self, ctx: &SystemContext) -> GuardrailDecision {
        let result = self
            .model
            .generate(LanguageModelInput {
                system_prompt: Some(GUARDRAIL_SYSTEM_PROMPT.to_string()),
                messages: vec![Message::user(format!(
                    "Conversation:\n{}",
                    ctx.message_history_text()
                ))],
                response_format: Some(ResponseFormatOption::Json(ResponseFormatJson {
                    name: "classification".to_string(),
                    schema: Some(classification_schema()),
                })),
                ..Default::default()
            })
            .await;

        let text = match result {
            Ok(response) => response.text,
            Err(error) => {
                warn!(%error, "guardrail classifier failed, allowing request");
                return GuardrailDecision::Allow;
            }
        };

        match decode_structured::<Classification>(&text, "guardrail") {
            Ok(parsed) if parsed.classification == "refuse" => GuardrailDecision::Refuse {
                reason: parsed
                    .reason
                    .unwrap_or_else(|| "This request cannot be assisted with.".to_string()),
            },
            Ok(_) => GuardrailDecision::Allow,
            Err(error) => {
                warn!(%error, "guardrail output unreadable, allowing request");
                GuardrailDecision::Allow
            }
        }
    }
}
