use crate::{
    context::SystemContext, errors::AgentResult, events::StreamEvent, stream::EventWriter,
};
use deepsearch_llm::{LanguageModel, LanguageModelInput, Message, StreamAccumulator};
use futures::StreamExt;
use std::sync::Arc;

const ANSWER_SYSTEM_PROMPT: &str = "You are a research assistant writing the final answer \
to the user's question from the gathered evidence.

Rules:
- Ground every claim in the evidence; cite sources as markdown inline links, e.g. \
[source](https://example.com).
- Preserve original units, dates, and figures.
- Answer in well-structured markdown.
- Do not mention the research process.";

const FINAL_ANSWER_NOTE: &str = "\n\nThe research budget is exhausted and the gathered \
information may be incomplete. Provide the best available answer from the evidence, note \
where information may be incomplete, and do not invent missing facts.";

const REFUSAL_SYSTEM_PROMPT: &str = "The request was declined by a safety review. Write a \
brief, polite message to the user explaining that you cannot help with this request. Mention \
the reason when one is given. Do not lecture and do not suggest workarounds.";

/// Streams the final sourced answer into the event stream.
pub struct Answerer {
    model: Arc<dyn LanguageModel>,
}

impl Answerer {
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Stream the answer as `text-delta` events. Returns the full answer text
    /// once the model stream completes. With `is_final` the prompt
    /// acknowledges that the evidence may be incomplete.
    pub async fn stream_answer(
        &self,
        ctx: &SystemContext,
        is_final: bool,
        writer: &EventWriter,
    ) -> AgentResult<String> {
        let mut system_prompt = ANSWER_SYSTEM_PROMPT.to_string();
        if is_final {
            system_prompt.push_str(FINAL_ANSWER_NOTE);
        }

        let user_prompt = format!(
            "Conversation:\n{}\n\nLocation hints: {}\n\nEvidence:\n{}",
            ctx.message_history_text(),
            ctx.location_hints(),
            ctx.search_history_text(),
        );

        self.stream_to_writer(system_prompt, user_prompt, writer)
            .await
    }

    /// Stream a short refusal message instead of running the loop.
    pub async fn stream_refusal(
        &self,
        ctx: &SystemContext,
        reason: &str,
        writer: &EventWriter,
    ) -> AgentResult<String> {
        let user_prompt = format!(
            "Conversation:\n{}\n\nRefusal reason: {}",
            ctx.message_history_text(),
            reason,
        );

        self.stream_to_writer(REFUSAL_SYSTEM_PROMPT.to_string(), user_prompt, writer)
            .await
    }

    async fn stream_to_writer(
        &self,
        system_prompt: String,
        user_prompt: String,
        writer: &EventWriter,
    ) -> AgentResult<String> {
        let mut stream = self
            .model
            .stream(LanguageModelInput {
                system_prompt: Some(system_prompt),
                messages: vec![Message::user(user_prompt)],
                ..Default::default()
            })
            .await?;

        let mut accumulator = StreamAccumulator::new();
        while let Some(partial) = stream.next().await {
            let partial = partial?;
            accumulator.add_partial(&partial);
            if let Some(delta) = partial.delta {
                writer.send(StreamEvent::TextDelta { delta }).await?;
            }
        }

        Ok(accumulator.compute_response().text)
    }
}
