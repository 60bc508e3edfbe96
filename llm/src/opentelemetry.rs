use crate::{
    LanguageModelInput, LanguageModelResult, LanguageModelStream, ModelResponse, ModelUsage,
    PartialModelResponse,
};
use ::opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Span, SpanKind, Status, Tracer},
    KeyValue,
};
use std::time::Instant;

pub struct LMSpan {
    span: BoxedSpan,
    start_time: Instant,
    stream_usage: Option<ModelUsage>,
    time_to_first_token: Option<f64>,
}

fn get_tracer() -> BoxedTracer {
    global::tracer("deepsearch-llm")
}

impl LMSpan {
    pub fn new(provider: &str, model_id: &str, method: &str, input: &LanguageModelInput) -> Self {
        let tracer = get_tracer();
        let mut span = tracer
            .span_builder(format!("llm.{method}"))
            .with_kind(SpanKind::Client)
            .with_attributes(vec![
                // https://opentelemetry.io/docs/specs/semconv/gen-ai/
                KeyValue::new("gen_ai.operation.name", "generate_content"),
                KeyValue::new("gen_ai.provider.name", provider.to_string()),
                KeyValue::new("gen_ai.request.model", model_id.to_string()),
            ])
            .start(&tracer);

        if let Some(max_tokens) = input.max_tokens {
            span.set_attribute(KeyValue::new(
                "gen_ai.request.max_tokens",
                i64::from(max_tokens),
            ));
        }
        if let Some(temperature) = input.temperature {
            span.set_attribute(KeyValue::new("gen_ai.request.temperature", temperature));
        }

        Self {
            span,
            start_time: Instant::now(),
            stream_usage: None,
            time_to_first_token: None,
        }
    }

    pub fn on_end(&mut self) {
        self.span.end();
    }

    pub fn on_response(&mut self, response: &ModelResponse) {
        if let Some(usage) = &response.usage {
            self.span.set_attribute(KeyValue::new(
                "gen_ai.usage.input_tokens",
                i64::from(usage.input_tokens),
            ));
            self.span.set_attribute(KeyValue::new(
                "gen_ai.usage.output_tokens",
                i64::from(usage.output_tokens),
            ));
        }
    }

    pub fn on_stream_partial(&mut self, partial: &PartialModelResponse) {
        if let Some(usage) = &partial.usage {
            let total = self.stream_usage.get_or_insert_with(ModelUsage::default);
            total.add(usage);
            self.span.set_attribute(KeyValue::new(
                "gen_ai.usage.input_tokens",
                i64::from(total.input_tokens),
            ));
            self.span.set_attribute(KeyValue::new(
                "gen_ai.usage.output_tokens",
                i64::from(total.output_tokens),
            ));
        }
        if partial.delta.is_some() && self.time_to_first_token.is_none() {
            let elapsed = self.start_time.elapsed().as_secs_f64();
            self.time_to_first_token = Some(elapsed);
            self.span
                .set_attribute(KeyValue::new("gen_ai.server.time_to_first_token", elapsed));
        }
    }

    pub fn on_error(&mut self, error: &dyn std::error::Error) {
        self.span.record_error(error);
        self.span.set_status(Status::error(error.to_string()));
    }
}

/// Wrapper adding span lifecycle tracking to a model stream.
pub struct TracedStream {
    inner: LanguageModelStream,
    span: Option<LMSpan>,
}

impl futures::Stream for TracedStream {
    type Item = LanguageModelResult<PartialModelResponse>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let poll_result = std::pin::Pin::new(&mut self.inner).poll_next(cx);

        match &poll_result {
            std::task::Poll::Ready(Some(Ok(partial))) => {
                if let Some(span) = self.span.as_mut() {
                    span.on_stream_partial(partial);
                }
            }
            std::task::Poll::Ready(Some(Err(error))) => {
                if let Some(span) = self.span.as_mut() {
                    span.on_error(error);
                }
            }
            std::task::Poll::Ready(None) => {
                if let Some(mut span) = self.span.take() {
                    span.on_end();
                }
            }
            std::task::Poll::Pending => {}
        }

        poll_result
    }
}

/// Wrap a generate call with a GenAI client span.
pub async fn trace_generate<F, Fut>(
    provider: &str,
    model_id: &str,
    input: LanguageModelInput,
    f: F,
) -> LanguageModelResult<ModelResponse>
where
    F: FnOnce(LanguageModelInput) -> Fut,
    Fut: std::future::Future<Output = LanguageModelResult<ModelResponse>>,
{
    let mut span = LMSpan::new(provider, model_id, "generate", &input);

    let result = f(input).await;

    match &result {
        Ok(response) => span.on_response(response),
        Err(error) => span.on_error(error),
    }

    span.on_end();
    result
}

/// Wrap a stream call with a GenAI client span that lives until the stream
/// is drained.
pub async fn trace_stream<F, Fut>(
    provider: &str,
    model_id: &str,
    input: LanguageModelInput,
    f: F,
) -> LanguageModelResult<LanguageModelStream>
where
    F: FnOnce(LanguageModelInput) -> Fut,
    Fut: std::future::Future<Output = LanguageModelResult<LanguageModelStream>>,
{
    let span = LMSpan::new(provider, model_id, "stream", &input);

    match f(input).await {
        Ok(stream) => Ok(LanguageModelStream::from_stream(TracedStream {
            inner: stream,
            span: Some(span),
        })),
        Err(error) => {
            let mut span = span;
            span.on_error(&error);
            span.on_end();
            Err(error)
        }
    }
}
