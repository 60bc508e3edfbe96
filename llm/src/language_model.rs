use crate::{LanguageModelInput, LanguageModelResult, ModelResponse, PartialModelResponse};
use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
};

/// The stream of partial responses produced by [`LanguageModel::stream`].
pub struct LanguageModelStream(
    Pin<Box<dyn Stream<Item = LanguageModelResult<PartialModelResponse>> + Send>>,
);

impl LanguageModelStream {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = LanguageModelResult<PartialModelResponse>> + Send + 'static,
    {
        Self(Box::pin(stream))
    }
}

impl Stream for LanguageModelStream {
    type Item = LanguageModelResult<PartialModelResponse>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.as_mut().poll_next(cx)
    }
}

#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> &'static str;
    fn model_id(&self) -> String;
    /// Generate a complete response for the input.
    async fn generate(&self, input: LanguageModelInput) -> LanguageModelResult<ModelResponse>;
    /// Generate a response as a stream of partial updates.
    async fn stream(&self, input: LanguageModelInput) -> LanguageModelResult<LanguageModelStream>;
}
