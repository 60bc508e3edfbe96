use crate::errors::AgentError;
use ::opentelemetry::trace::Status;
use std::future::Future;
use tracing::{info_span, Span};
use tracing_futures::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Root span for one request through the agent loop. All stage spans nest
/// under it.
pub struct RunSpan {
    span: Span,
}

impl RunSpan {
    #[must_use]
    pub fn new(request_id: &str) -> Self {
        let span = info_span!("deepsearch.run");
        span.set_attribute("gen_ai.operation.name", "invoke_agent");
        span.set_attribute("gen_ai.agent.name", "deepsearch");
        span.set_attribute("deepsearch.request_id", request_id.to_string());
        Self { span }
    }

    #[must_use]
    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn on_step(&self, step: usize) {
        self.span.set_attribute("deepsearch.steps", step as i64);
    }

    pub fn on_error(&self, error: &AgentError) {
        self.span
            .set_attribute("exception.message", error.to_string());
        self.span.set_status(Status::error(error.to_string()));
    }
}

/// Run one loop stage (rewrite, evaluate, answer, guardrail) under its own
/// span, recording failures on the span before propagating them.
pub async fn trace_stage<T, Fut>(stage: &'static str, step: usize, future: Fut) -> Result<T, AgentError>
where
    Fut: Future<Output = Result<T, AgentError>> + Send,
{
    let span = info_span!("deepsearch.stage", stage, step);
    span.set_attribute("deepsearch.stage", stage);
    span.set_attribute("deepsearch.step", step as i64);

    match future.instrument(span.clone()).await {
        Ok(value) => Ok(value),
        Err(error) => {
            span.set_attribute("exception.message", error.to_string());
            span.set_status(Status::error(error.to_string()));
            Err(error)
        }
    }
}
