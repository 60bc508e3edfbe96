use crate::{errors::AgentError, events::StreamEvent, kv::KvStore};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

const BROADCAST_CAPACITY: usize = 256;

/// Handle through which the loop driver pushes events toward the client.
/// A failed send means the consumer is gone, which the driver treats as
/// cancellation.
#[derive(Clone)]
pub struct EventWriter {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventWriter {
    /// Create a writer and the receiving half consumed by the HTTP layer.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    pub async fn send(&self, event: StreamEvent) -> Result<(), AgentError> {
        self.tx.send(event).await.map_err(|_| AgentError::Cancelled)
    }
}

struct StreamHandle {
    stream_id: String,
    tx: broadcast::Sender<StreamEvent>,
    // Events already published, replayed to late subscribers before they
    // switch to the live feed.
    backlog: Vec<StreamEvent>,
}

/// A late subscriber's view of an in-flight stream: the backlog so far plus
/// the live feed.
pub struct StreamSubscription {
    pub backlog: Vec<StreamEvent>,
    pub live: broadcast::Receiver<StreamEvent>,
}

/// Registry of in-flight streams keyed by chat id. The producer runs once;
/// the original response and any resumed responses draw from the same
/// broadcast. Stream ids are mirrored into the key-value store so external
/// collaborators can discover active runs.
pub struct ResumableStreams {
    kv: Arc<dyn KvStore>,
    record_ttl: Duration,
    inner: Mutex<HashMap<String, StreamHandle>>,
}

impl ResumableStreams {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, record_ttl: Duration) -> Self {
        Self {
            kv,
            record_ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new producer for `chat_id`, replacing any stale handle.
    pub async fn register(&self, chat_id: &str) -> String {
        let stream_id = uuid::Uuid::new_v4().to_string();
        {
            let mut inner = self.inner.lock().expect("stream registry poisoned");
            let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
            inner.insert(
                chat_id.to_string(),
                StreamHandle {
                    stream_id: stream_id.clone(),
                    tx,
                    backlog: Vec::new(),
                },
            );
        }

        if let Err(error) = self
            .kv
            .set_ex(&stream_key(chat_id), &stream_id, self.record_ttl)
            .await
        {
            warn!(%chat_id, %error, "failed to record stream id");
        }

        stream_id
    }

    /// Publish one event to the chat's subscribers and backlog.
    pub fn publish(&self, chat_id: &str, event: &StreamEvent) {
        let mut inner = self.inner.lock().expect("stream registry poisoned");
        if let Some(handle) = inner.get_mut(chat_id) {
            handle.backlog.push(event.clone());
            // A send error only means there are no live subscribers yet.
            let _ = handle.tx.send(event.clone());
        }
    }

    /// Attach to an in-flight stream. The backlog snapshot and the broadcast
    /// subscription are taken under one lock, so no event is lost or
    /// duplicated between them.
    pub fn subscribe(&self, chat_id: &str) -> Option<StreamSubscription> {
        let inner = self.inner.lock().expect("stream registry poisoned");
        inner.get(chat_id).map(|handle| StreamSubscription {
            backlog: handle.backlog.clone(),
            live: handle.tx.subscribe(),
        })
    }

    /// Tear down the producer for `chat_id`. Dropping the broadcast sender
    /// ends every live subscriber's stream.
    pub async fn finish(&self, chat_id: &str) {
        let removed = {
            let mut inner = self.inner.lock().expect("stream registry poisoned");
            inner.remove(chat_id)
        };

        if removed.is_some() {
            if let Err(error) = self.kv.del(&stream_key(chat_id)).await {
                warn!(%chat_id, %error, "failed to clear stream id");
            }
        }
    }

    /// The stream id currently registered for `chat_id`, if any.
    pub fn active_stream_id(&self, chat_id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("stream registry poisoned");
        inner.get(chat_id).map(|handle| handle.stream_id.clone())
    }
}

fn stream_key(chat_id: &str) -> String {
    format!("stream:{chat_id}")
}
