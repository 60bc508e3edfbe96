use crate::{
    client_utils, opentelemetry, LanguageModel, LanguageModelError, LanguageModelInput,
    LanguageModelResult, LanguageModelStream, Message, MessageRole, ModelResponse, ModelUsage,
    PartialModelResponse, ResponseFormatOption,
};
use async_stream::try_stream;
use futures::StreamExt;
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Client,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const PROVIDER: &str = "openai-compat";

/// A language model served over an OpenAI-compatible chat completions API.
pub struct OpenAICompatModel {
    model_id: String,
    api_key: String,
    base_url: String,
    client: Client,
}

#[derive(Clone, Default)]
pub struct OpenAICompatModelOptions {
    /// Base URL of the API, e.g. `https://api.openai.com/v1`.
    pub base_url: Option<String>,
    pub api_key: String,
    pub client: Option<Client>,
}

impl OpenAICompatModel {
    #[must_use]
    pub fn new(model_id: impl Into<String>, options: OpenAICompatModelOptions) -> Self {
        let OpenAICompatModelOptions {
            base_url,
            api_key,
            client,
        } = options;

        let base_url = base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        Self {
            model_id: model_id.into(),
            api_key,
            base_url,
            client: client.unwrap_or_default(),
        }
    }

    fn request_headers(&self) -> LanguageModelResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|error| {
            LanguageModelError::InvalidInput(format!("Invalid API key header value: {error}"))
        })?;
        headers.insert(header::AUTHORIZATION, auth);
        Ok(headers)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAICompatModel {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn model_id(&self) -> String {
        self.model_id.clone()
    }

    async fn generate(&self, input: LanguageModelInput) -> LanguageModelResult<ModelResponse> {
        opentelemetry::trace_generate(self.provider(), &self.model_id(), input, |input| async move {
            let request = to_chat_request(input, &self.model_id, false);
            let headers = self.request_headers()?;

            let response: ChatCompletionResponse =
                client_utils::send_json(&self.client, &self.endpoint(), &request, headers).await?;

            let choice = response.choices.into_iter().next().ok_or_else(|| {
                LanguageModelError::Invariant(PROVIDER, "No choices in response".to_string())
            })?;

            if let Some(refusal) = choice.message.refusal.filter(|r| !r.is_empty()) {
                return Err(LanguageModelError::Refusal(refusal));
            }

            Ok(ModelResponse {
                text: choice.message.content.unwrap_or_default(),
                usage: response.usage.map(ModelUsage::from),
            })
        })
        .await
    }

    async fn stream(&self, input: LanguageModelInput) -> LanguageModelResult<LanguageModelStream> {
        opentelemetry::trace_stream(self.provider(), &self.model_id(), input, |input| async move {
            let request = to_chat_request(input, &self.model_id, true);
            let headers = self.request_headers()?;

            let mut chunks = client_utils::send_sse_stream::<ChatCompletionRequest, ChatCompletionChunk>(
                &self.client,
                &self.endpoint(),
                &request,
                headers,
                PROVIDER,
            )
            .await?;

            let stream = try_stream! {
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk?;

                    if let Some(choice) = chunk.choices.into_iter().next() {
                        if let Some(refusal) = choice.delta.refusal.filter(|r| !r.is_empty()) {
                            Err(LanguageModelError::Refusal(refusal))?;
                        }
                        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                            yield PartialModelResponse::delta(content);
                        }
                    }

                    if let Some(usage) = chunk.usage {
                        yield PartialModelResponse {
                            delta: None,
                            usage: Some(ModelUsage::from(usage)),
                        };
                    }
                }
            };

            Ok(LanguageModelStream::from_stream(stream))
        })
        .await
    }
}

fn to_chat_request(input: LanguageModelInput, model_id: &str, stream: bool) -> ChatCompletionRequest {
    let mut messages: Vec<ChatMessage> = Vec::new();
    if let Some(system_prompt) = input.system_prompt {
        messages.push(ChatMessage {
            role: "system",
            content: system_prompt,
        });
    }
    for message in input.messages {
        messages.push(ChatMessage {
            role: match message.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            },
            content: message.content,
        });
    }

    let response_format = input.response_format.map(|format| match format {
        ResponseFormatOption::Text => serde_json::json!({ "type": "text" }),
        ResponseFormatOption::Json(json) => serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": json.name,
                "schema": json.schema,
                "strict": true,
            },
        }),
    });

    ChatCompletionRequest {
        model: model_id.to_string(),
        messages,
        max_tokens: input.max_tokens,
        temperature: input.temperature,
        response_format,
        stream,
        stream_options: stream.then(|| serde_json::json!({ "include_usage": true })),
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChatChunkChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChunkChoice {
    delta: ChatChunkDelta,
}

#[derive(Debug, Deserialize, Default)]
struct ChatChunkDelta {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<ChatUsage> for ModelUsage {
    fn from(usage: ChatUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}
