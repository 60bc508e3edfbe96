use crate::action::{Action, ActionType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    Loading,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Error,
}

/// One consolidated source shown to the client after a step's barrier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub favicon: String,
}

/// Typed progress events streamed to the client while the loop runs.
/// Tags and payloads are the wire protocol; field names are camelCase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    NewChatCreated { chat_id: String },
    Planning { title: String, reasoning: String },
    QueriesGenerated { plan: String, queries: Vec<String> },
    #[serde(rename_all = "camelCase")]
    SearchUpdate {
        query_index: usize,
        query: String,
        status: SearchStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SourcesFound {
        step_index: usize,
        sources: Vec<Source>,
    },
    NewAction { action: Action },
    #[serde(rename_all = "camelCase")]
    EvaluatorFeedback {
        feedback: String,
        action_type: ActionType,
    },
    #[serde(rename_all = "camelCase")]
    ActionUpdate {
        step_index: usize,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TextDelta { delta: String },
    Error { message: String },
}
