use crate::errors::AgentError;
use serde::{Deserialize, Serialize};

/// The evaluator's decision for one step. `feedback` is mandatory for both
/// variants: guidance for future iterations on `continue`, caveats on
/// `answer`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    Continue {
        title: String,
        reasoning: String,
        feedback: String,
    },
    Answer {
        title: String,
        reasoning: String,
        feedback: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Continue,
    Answer,
}

impl Action {
    #[must_use]
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Continue { .. } => ActionType::Continue,
            Self::Answer { .. } => ActionType::Answer,
        }
    }

    #[must_use]
    pub fn feedback(&self) -> &str {
        match self {
            Self::Continue { feedback, .. } | Self::Answer { feedback, .. } => feedback,
        }
    }

    /// Strict decoding: every action needs a non-empty title, reasoning, and
    /// feedback.
    pub fn validate(&self) -> Result<(), AgentError> {
        let (title, reasoning, feedback) = match self {
            Self::Continue {
                title,
                reasoning,
                feedback,
            }
            | Self::Answer {
                title,
                reasoning,
                feedback,
            } => (title, reasoning, feedback),
        };

        for (field, value) in [
            ("title", title),
            ("reasoning", reasoning),
            ("feedback", feedback),
        ] {
            if value.trim().is_empty() {
                return Err(AgentError::Planner(format!(
                    "evaluator action is missing {field}"
                )));
            }
        }
        Ok(())
    }
}

/// The rewriter's output: a research plan and the queries to run this step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryPlan {
    pub plan: String,
    pub queries: Vec<String>,
}

impl QueryPlan {
    pub const MIN_QUERIES: usize = 3;
    pub const MAX_QUERIES: usize = 5;

    /// Strict decoding: between 3 and 5 non-empty queries.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.queries.len() < Self::MIN_QUERIES || self.queries.len() > Self::MAX_QUERIES {
            return Err(AgentError::Planner(format!(
                "rewriter produced {} queries, expected {}..={}",
                self.queries.len(),
                Self::MIN_QUERIES,
                Self::MAX_QUERIES
            )));
        }
        if self.queries.iter().any(|q| q.trim().is_empty()) {
            return Err(AgentError::Planner(
                "rewriter produced an empty query".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decode a structured LLM completion, tolerating markdown code fences.
pub(crate) fn decode_structured<T: serde::de::DeserializeOwned>(
    text: &str,
    what: &str,
) -> Result<T, AgentError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);

    serde_json::from_str(body.trim())
        .map_err(|error| AgentError::Planner(format!("{what} returned invalid JSON: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_structured_strips_code_fences() {
        let plan: QueryPlan = decode_structured(
            "```json\n{\"plan\":\"p\",\"queries\":[\"a\",\"b\",\"c\"]}\n```",
            "rewriter",
        )
        .unwrap();
        assert_eq!(plan.queries.len(), 3);
    }

    #[test]
    fn action_round_trips_with_type_tag() {
        let action = Action::Answer {
            title: "Ready".to_string(),
            reasoning: "Everything is covered".to_string(),
            feedback: "None".to_string(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "answer");
        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn action_missing_feedback_fails_validation() {
        let action = Action::Continue {
            title: "More".to_string(),
            reasoning: "Gaps remain".to_string(),
            feedback: "  ".to_string(),
        };
        assert!(action.validate().is_err());
    }

    #[test]
    fn query_plan_rejects_out_of_range_lengths() {
        let short = QueryPlan {
            plan: "p".to_string(),
            queries: vec!["a".to_string(), "b".to_string()],
        };
        assert!(short.validate().is_err());

        let long = QueryPlan {
            plan: "p".to_string(),
            queries: (0..6).map(|i| format!("q{i}")).collect(),
        };
        assert!(long.validate().is_err());

        let ok = QueryPlan {
            plan: "p".to_string(),
            queries: (0..4).map(|i| format!("q{i}")).collect(),
        };
        assert!(ok.validate().is_ok());
    }
}
