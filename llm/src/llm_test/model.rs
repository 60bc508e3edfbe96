use std::{collections::VecDeque, sync::Mutex};

use futures::stream;

use crate::{
    LanguageModel, LanguageModelError, LanguageModelInput, LanguageModelResult,
    LanguageModelStream, ModelResponse, PartialModelResponse,
};

/// Result for a mocked `generate` call: a full response or an error to return.
pub enum MockGenerateResult {
    Response(ModelResponse),
    Error(LanguageModelError),
}

impl From<ModelResponse> for MockGenerateResult {
    fn from(response: ModelResponse) -> Self {
        Self::Response(response)
    }
}

impl From<LanguageModelError> for MockGenerateResult {
    fn from(error: LanguageModelError) -> Self {
        Self::Error(error)
    }
}

/// Result for a mocked `stream` call: partial responses or an error to return.
pub enum MockStreamResult {
    Partials(Vec<PartialModelResponse>),
    Error(LanguageModelError),
}

impl From<Vec<PartialModelResponse>> for MockStreamResult {
    fn from(partials: Vec<PartialModelResponse>) -> Self {
        Self::Partials(partials)
    }
}

impl From<LanguageModelError> for MockStreamResult {
    fn from(error: LanguageModelError) -> Self {
        Self::Error(error)
    }
}

#[derive(Default)]
struct MockLanguageModelState {
    mocked_generate_results: VecDeque<MockGenerateResult>,
    mocked_stream_results: VecDeque<MockStreamResult>,
    tracked_generate_inputs: Vec<LanguageModelInput>,
    tracked_stream_inputs: Vec<LanguageModelInput>,
}

/// A mock language model for testing that tracks inputs and yields predefined
/// outputs.
#[derive(Default)]
pub struct MockLanguageModel {
    state: Mutex<MockLanguageModelState>,
}

impl MockLanguageModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a mocked generate result.
    pub fn enqueue_generate<R>(&self, result: R) -> &Self
    where
        R: Into<MockGenerateResult>,
    {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.mocked_generate_results.push_back(result.into());
        drop(state);
        self
    }

    /// Enqueue a mocked generate result that returns the given text.
    pub fn enqueue_generate_text(&self, text: impl Into<String>) -> &Self {
        self.enqueue_generate(ModelResponse {
            text: text.into(),
            ..Default::default()
        })
    }

    /// Enqueue a mocked stream result.
    pub fn enqueue_stream<R>(&self, result: R) -> &Self
    where
        R: Into<MockStreamResult>,
    {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.mocked_stream_results.push_back(result.into());
        drop(state);
        self
    }

    /// Enqueue a mocked stream result that yields one delta per given chunk.
    pub fn enqueue_stream_text<I>(&self, chunks: I) -> &Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.enqueue_stream(
            chunks
                .into_iter()
                .map(|chunk| PartialModelResponse::delta(chunk.into()))
                .collect::<Vec<_>>(),
        )
    }

    /// Retrieve the tracked generate inputs accumulated so far.
    pub fn tracked_generate_inputs(&self) -> Vec<LanguageModelInput> {
        let state = self.state.lock().expect("mock state poisoned");
        state.tracked_generate_inputs.clone()
    }

    /// Retrieve the tracked stream inputs accumulated so far.
    pub fn tracked_stream_inputs(&self) -> Vec<LanguageModelInput> {
        let state = self.state.lock().expect("mock state poisoned");
        state.tracked_stream_inputs.clone()
    }
}

#[async_trait::async_trait]
impl LanguageModel for MockLanguageModel {
    fn provider(&self) -> &'static str {
        "mock"
    }

    fn model_id(&self) -> String {
        "mock-model".to_string()
    }

    async fn generate(&self, input: LanguageModelInput) -> LanguageModelResult<ModelResponse> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.tracked_generate_inputs.push(input);

        let result = state.mocked_generate_results.pop_front().ok_or_else(|| {
            LanguageModelError::Invariant("mock", "no mocked generate results available".into())
        })?;

        match result {
            MockGenerateResult::Response(response) => Ok(response),
            MockGenerateResult::Error(error) => Err(error),
        }
    }

    async fn stream(&self, input: LanguageModelInput) -> LanguageModelResult<LanguageModelStream> {
        let mut state = self.state.lock().expect("mock state poisoned");

        let result = state.mocked_stream_results.pop_front().ok_or_else(|| {
            LanguageModelError::Invariant("mock", "no mocked stream results available".into())
        })?;

        state.tracked_stream_inputs.push(input);

        match result {
            MockStreamResult::Error(error) => Err(error),
            MockStreamResult::Partials(partials) => Ok(LanguageModelStream::from_stream(
                stream::iter(partials.into_iter().map(Ok)),
            )),
        }
    }
}
