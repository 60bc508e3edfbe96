use crate::LanguageModelError;
use eventsource_stream::Eventsource;
use futures::{stream::StreamExt, Stream};
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::pin::Pin;

/// Create a JSON request, parse the response.
/// Errors on non-OK status codes.
pub async fn send_json<T: Serialize, R: DeserializeOwned>(
    client: &Client,
    url: &str,
    data: &T,
    headers: reqwest::header::HeaderMap,
) -> Result<R, LanguageModelError> {
    let response = client.post(url).headers(headers).json(data).send().await?;
    if response.status().is_success() {
        Ok(response.json::<R>().await?)
    } else {
        Err(LanguageModelError::StatusCode(
            response.status(),
            response.text().await.unwrap_or_default(),
        ))
    }
}

/// Create a JSON request that returns a typed stream of parsed SSE chunks.
/// Handles SSE framing, JSON deserialization, and `[DONE]` termination.
pub async fn send_sse_stream<T: Serialize, R: DeserializeOwned + Send + 'static>(
    client: &Client,
    url: &str,
    data: &T,
    headers: reqwest::header::HeaderMap,
    provider: &'static str,
) -> Result<Pin<Box<dyn Stream<Item = Result<R, LanguageModelError>> + Send>>, LanguageModelError> {
    let response = client.post(url).headers(headers).json(data).send().await?;

    if !response.status().is_success() {
        return Err(LanguageModelError::StatusCode(
            response.status(),
            response.text().await.unwrap_or_default(),
        ));
    }

    let mut sse_stream = response.bytes_stream().eventsource();

    let stream = async_stream::try_stream! {
        while let Some(event) = sse_stream.next().await {
            match event {
                Ok(event) => {
                    if event.data.is_empty() {
                        continue;
                    }
                    if event.data == "[DONE]" {
                        break;
                    }

                    let chunk: R = serde_json::from_str(&event.data).map_err(|e| {
                        LanguageModelError::Invariant(
                            provider,
                            format!("Failed to parse stream chunk: {e}"),
                        )
                    })?;

                    yield chunk;
                }
                Err(eventsource_stream::EventStreamError::Transport(e)) => {
                    Err(LanguageModelError::Transport(e))?;
                }
                Err(e) => {
                    Err(LanguageModelError::Invariant(
                        provider,
                        format!("Invalid event stream data: {e}"),
                    ))?;
                }
            }
        }
    };

    Ok(Box::pin(stream))
}
