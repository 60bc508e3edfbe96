use crate::{
    auth::{Session, SessionAuth},
    store::ChatStore,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{sse::Event, sse::KeepAlive, IntoResponse, Response, Sse},
    Json,
};
use deepsearch_agent::{
    AgentError, ChatMessage, ChatRole, EventWriter, OnFinish, RateLimitDecision, RequestUser,
    ResumableStreams, RunSession, StreamEvent, StreamSubscription, SystemContext,
};
use futures::Stream;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{error, warn};

const CHAT_TITLE_MAX_CHARS: usize = 80;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<RunSession>,
    pub auth: Arc<dyn SessionAuth>,
    pub chats: Arc<dyn ChatStore>,
    pub streams: Arc<ResumableStreams>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResumeQuery {
    #[serde(rename = "chatId")]
    pub chat_id: String,
}

pub async fn home() -> &'static str {
    "deepsearch server"
}

/// `POST /chat`: run the agent loop for one chat turn, streaming progress
/// events and the answer as SSE.
pub async fn post_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Response {
    let session = match authenticate(&state, &headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    if body.messages.is_empty() {
        return (StatusCode::BAD_REQUEST, "messages must not be empty").into_response();
    }

    // Admission gates run before any side effect, storage included: a denied
    // request must not create a chat row.
    let user = RequestUser {
        id: session.user_id.clone(),
    };
    if let Err(AgentError::Admission(decision)) = state.session.admit(&user).await {
        return rate_limited(&decision);
    }

    let (chat_id, created) = match body.chat_id {
        Some(chat_id) => match state.chats.get_chat(&chat_id, &session.user_id).await {
            Ok(Some(chat)) => (chat.id, false),
            Ok(None) => return (StatusCode::NOT_FOUND, "chat not found").into_response(),
            Err(error) => {
                error!(%error, "chat lookup failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
                    .into_response();
            }
        },
        None => {
            let title = derive_title(&body.messages);
            match state.chats.create_chat(&session.user_id, &title).await {
                Ok(chat) => (chat.id, true),
                Err(error) => {
                    error!(%error, "chat creation failed");
                    return (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
                        .into_response();
                }
            }
        }
    };

    if let Some(message) = body.messages.iter().rev().find(|m| m.role == ChatRole::User) {
        if let Err(error) = state
            .chats
            .append_message(&chat_id, ChatRole::User, &message.text())
            .await
        {
            warn!(%error, "failed to persist user message");
        }
    }

    let ctx = SystemContext::new(body.messages, location_context(&headers));

    state.streams.register(&chat_id).await;
    if created {
        state.streams.publish(
            &chat_id,
            &StreamEvent::NewChatCreated {
                chat_id: chat_id.clone(),
            },
        );
    }

    // The subscription is taken before the driver starts, so this response
    // replays the backlog (at most `new-chat-created`) and then follows live.
    let subscription = match state.streams.subscribe(&chat_id) {
        Some(subscription) => subscription,
        None => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "stream registration lost")
                .into_response()
        }
    };

    let (writer, mut rx) = EventWriter::channel(64);

    // Forwarder: the single consumer of the driver's channel, mirroring
    // events into the broadcast so late subscribers share this producer.
    {
        let streams = state.streams.clone();
        let chat_id = chat_id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                streams.publish(&chat_id, &event);
            }
            streams.finish(&chat_id).await;
        });
    }

    // Driver task: owns the loop; persists the assistant message on finish.
    {
        let run_session = state.session.clone();
        let chats = state.chats.clone();
        let finish_chat_id = chat_id.clone();
        let on_finish: OnFinish = Box::new(move |text: String| {
            Box::pin(async move {
                if let Err(error) = chats
                    .append_message(&finish_chat_id, ChatRole::Assistant, &text)
                    .await
                {
                    warn!(%error, "failed to persist assistant message");
                }
            })
        });

        tokio::spawn(async move {
            run_session.run(ctx, writer, Some(on_finish)).await;
        });
    }

    sse_response(subscription)
}

/// `GET /chat?chatId=…`: attach to the chat's in-flight run, replaying the
/// events already emitted.
pub async fn resume_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ResumeQuery>,
) -> Response {
    let session = match authenticate(&state, &headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    match state.chats.get_chat(&query.chat_id, &session.user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "chat not found").into_response(),
        Err(error) => {
            error!(%error, "chat lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable").into_response();
        }
    }

    match state.streams.subscribe(&query.chat_id) {
        Some(subscription) => sse_response(subscription),
        None => (StatusCode::NOT_FOUND, "no active stream").into_response(),
    }
}

/// `DELETE /chat/{id}`
pub async fn delete_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> Response {
    let session = match authenticate(&state, &headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    match state.chats.delete_chat(&chat_id, &session.user_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, "chat not found").into_response(),
        Err(error) => {
            error!(%error, "chat deletion failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable").into_response()
        }
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Session, Response> {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    state
        .auth
        .authenticate(bearer)
        .await
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "authentication required").into_response())
}

fn rate_limited(decision: &RateLimitDecision) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({ "error": "rate limit exceeded" })),
    )
        .into_response();

    let headers = response.headers_mut();
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("X-Rate-Limit-Limit", value);
    }
    if let Ok(value) = decision.remaining.to_string().parse() {
        headers.insert("X-Rate-Limit-Remaining", value);
    }
    if let Ok(value) = decision.reset_at.timestamp().to_string().parse() {
        headers.insert("X-Rate-Limit-Reset", value);
    }
    response
}

fn sse_response(subscription: StreamSubscription) -> Response {
    Sse::new(subscription_stream(subscription))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

fn subscription_stream(
    subscription: StreamSubscription,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    let StreamSubscription { backlog, mut live } = subscription;
    async_stream::stream! {
        for event in &backlog {
            yield Ok(encode_event(event));
        }

        loop {
            match live.recv().await {
                Ok(event) => yield Ok(encode_event(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn encode_event(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(error) => {
            error!(%error, "failed to encode stream event");
            Event::default().data(r#"{"type":"error","message":"internal error"}"#)
        }
    }
}

fn derive_title(messages: &[ChatMessage]) -> String {
    let first_user = messages
        .iter()
        .find(|m| m.role == ChatRole::User)
        .map_or_else(|| "New chat".to_string(), ChatMessage::text);
    first_user.chars().take(CHAT_TITLE_MAX_CHARS).collect()
}

/// Opaque origin hints passed into the loop's prompts, assembled from the
/// usual proxy headers.
fn location_context(headers: &HeaderMap) -> String {
    let mut hints = Vec::new();
    for (header, label) in [
        ("x-vercel-ip-city", "city"),
        ("x-vercel-ip-country", "country"),
        ("cf-ipcity", "city"),
        ("cf-ipcountry", "country"),
    ] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                hints.push(format!("{label}: {value}"));
            }
        }
    }
    hints.join(", ")
}
