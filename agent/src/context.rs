use serde::{Deserialize, Serialize};

/// The author of a chat message as stored and sent by the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// A typed part of a chat message. Text is the only part kind the loop
/// consumes; clients may send richer parts, which deserialize alongside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    Text { text: String },
}

/// One message of the conversation driving the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    pub role: ChatRole,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: String::new(),
            role: ChatRole::User,
            parts: vec![MessagePart::Text {
                text: content.clone(),
            }],
            content,
        }
    }

    /// The message text: `content` when present, otherwise the joined text
    /// parts.
    #[must_use]
    pub fn text(&self) -> String {
        if !self.content.is_empty() {
            return self.content.clone();
        }
        self.parts
            .iter()
            .map(|part| match part {
                MessagePart::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One search result after scrape and summarization.
/// If `summary` is non-empty then `scraped_content` was non-empty at
/// summarization time, unless the summary fell back to the snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub date: String,
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub scraped_content: String,
    pub summary: String,
}

/// One query's aggregated results for one loop step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub query: String,
    pub results: Vec<SearchResult>,
}

/// Per-request mutable state read by the prompt builders. Created at loop
/// entry, written only by the driver, discarded when the response ends.
pub struct SystemContext {
    location_context: String,
    messages: Vec<ChatMessage>,
    search_history: Vec<SearchHistoryEntry>,
    feedback: String,
    step: usize,
}

impl SystemContext {
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>, location_context: String) -> Self {
        Self {
            location_context,
            messages,
            search_history: Vec::new(),
            feedback: String::new(),
            step: 0,
        }
    }

    #[must_use]
    pub fn current_step(&self) -> usize {
        self.step
    }

    pub fn increment_step(&mut self) {
        self.step += 1;
    }

    #[must_use]
    pub fn last_feedback(&self) -> &str {
        &self.feedback
    }

    /// Overwrites any previous feedback.
    pub fn record_feedback(&mut self, feedback: impl Into<String>) {
        self.feedback = feedback.into();
    }

    pub fn record_search(&mut self, entry: SearchHistoryEntry) {
        self.search_history.push(entry);
    }

    #[must_use]
    pub fn search_history(&self) -> &[SearchHistoryEntry] {
        &self.search_history
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The most recent user message, or empty if there is none.
    #[must_use]
    pub fn last_user_message(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map_or_else(String::new, ChatMessage::text)
    }

    #[must_use]
    pub fn location_hints(&self) -> &str {
        &self.location_context
    }

    /// Conversation formatted for prompts.
    #[must_use]
    pub fn message_history_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::User => "User",
                    ChatRole::Assistant => "Assistant",
                    ChatRole::System => "System",
                };
                format!("{role}: {}", m.text())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Accumulated search evidence formatted for prompts. Each result carries
    /// its summary when one exists, otherwise the raw scrape.
    #[must_use]
    pub fn search_history_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.search_history {
            out.push_str(&format!("## Query: \"{}\"\n", entry.query));
            for result in &entry.results {
                let synthesized = if result.summary.is_empty() {
                    &result.scraped_content
                } else {
                    &result.summary
                };
                out.push_str(&format!(
                    "### {} - {}\n{}\n{}\n<content_summary>\n{}\n</content_summary>\n\n",
                    result.date, result.title, result.url, result.snippet, synthesized,
                ));
            }
        }
        out
    }

    /// All canonical URLs recorded so far, in order of first appearance.
    #[must_use]
    pub fn recorded_urls(&self) -> Vec<&str> {
        self.search_history
            .iter()
            .flat_map(|entry| entry.results.iter().map(|r| r.url.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(url: &str, summary: &str) -> SearchResult {
        SearchResult {
            date: "2024-05-01".to_string(),
            title: "Title".to_string(),
            url: url.to_string(),
            snippet: "Snippet".to_string(),
            scraped_content: "Scraped".to_string(),
            summary: summary.to_string(),
        }
    }

    #[test]
    fn feedback_is_overwritten_not_appended() {
        let mut ctx = SystemContext::new(vec![], String::new());
        ctx.record_feedback("first");
        ctx.record_feedback("second");
        assert_eq!(ctx.last_feedback(), "second");
    }

    #[test]
    fn search_history_text_prefers_summary() {
        let mut ctx = SystemContext::new(vec![], String::new());
        ctx.record_search(SearchHistoryEntry {
            query: "q".to_string(),
            results: vec![result("https://a.example", "The summary")],
        });

        let text = ctx.search_history_text();
        assert!(text.contains("## Query: \"q\""));
        assert!(text.contains("<content_summary>\nThe summary\n</content_summary>"));
    }

    #[test]
    fn search_history_text_falls_back_to_scrape() {
        let mut ctx = SystemContext::new(vec![], String::new());
        ctx.record_search(SearchHistoryEntry {
            query: "q".to_string(),
            results: vec![result("https://a.example", "")],
        });
        assert!(ctx.search_history_text().contains("Scraped"));
    }

    #[test]
    fn last_user_message_skips_assistant_turns() {
        let ctx = SystemContext::new(
            vec![
                ChatMessage::user("first question"),
                ChatMessage {
                    id: String::new(),
                    role: ChatRole::Assistant,
                    content: "answer".to_string(),
                    parts: Vec::new(),
                },
            ],
            String::new(),
        );
        assert_eq!(ctx.last_user_message(), "first question");
    }

    #[test]
    fn message_text_falls_back_to_parts() {
        let message = ChatMessage {
            id: String::new(),
            role: ChatRole::User,
            content: String::new(),
            parts: vec![MessagePart::Text {
                text: "from parts".to_string(),
            }],
        };
        assert_eq!(message.text(), "from parts");
    }
}
