use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// One ranked hit from the web search provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    /// Publication date as reported by the provider, empty when unknown.
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Error)]
#[error("search failed: {message}")]
pub struct SearchError {
    pub message: String,
    /// Whether retrying the same query may succeed.
    pub retryable: bool,
}

impl SearchError {
    fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Run one query, returning up to `num` ranked hits with canonical URLs.
    /// `num` is clamped to `[1, 10]`.
    async fn search(&self, query: &str, num: usize) -> Result<Vec<SearchHit>, SearchError>;
}

/// Canonicalize a URL: scheme and host lowercased, fragment dropped, trailing
/// slash trimmed. Returns `None` for non-http(s) or unparseable input.
#[must_use]
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    let mut out = url.to_string();
    if out.ends_with('/') && url.query().is_none() {
        out.pop();
    }
    Some(out)
}

/// Favicon URL for the host serving `page_url`.
#[must_use]
pub fn favicon_url(page_url: &str) -> String {
    let host = Url::parse(page_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    format!("https://www.google.com/s2/favicons?domain={host}&sz=32")
}

/// Search provider backed by the Serper.dev Google search API.
#[derive(Debug, Clone)]
pub struct SerperSearch {
    client: reqwest::Client,
    api_key: String,
}

impl SerperSearch {
    #[must_use]
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { client, api_key }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self, SearchError> {
        let api_key = std::env::var("SERPER_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| SearchError::fatal("missing SERPER_API_KEY"))?;
        Ok(Self::new(client, api_key))
    }

    fn endpoint() -> String {
        std::env::var("SERPER_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://google.serper.dev/search".to_string())
    }
}

#[async_trait::async_trait]
impl SearchProvider for SerperSearch {
    fn name(&self) -> &'static str {
        "serper"
    }

    async fn search(&self, query: &str, num: usize) -> Result<Vec<SearchHit>, SearchError> {
        let num = num.clamp(1, 10);
        let body = serde_json::json!({ "q": query, "num": num });

        let response = self
            .client
            .post(Self::endpoint())
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .timeout(Duration::from_secs(20))
            .send()
            .await
            .map_err(|e| SearchError::retryable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("search provider HTTP {status}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                SearchError::retryable(message)
            } else {
                SearchError::fatal(message)
            });
        }

        let parsed: SerperResponse = response
            .json()
            .await
            .map_err(|e| SearchError::fatal(format!("invalid search response: {e}")))?;

        Ok(parsed
            .organic
            .into_iter()
            .filter_map(|hit| {
                let url = canonical_url(&hit.link)?;
                Some(SearchHit {
                    title: hit.title,
                    url,
                    snippet: hit.snippet.unwrap_or_default(),
                    date: hit.date.unwrap_or_default(),
                })
            })
            .take(num)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperHit>,
}

#[derive(Debug, Deserialize)]
struct SerperHit {
    title: String,
    link: String,
    snippet: Option<String>,
    date: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_url_lowercases_and_trims_slash() {
        assert_eq!(
            canonical_url("HTTPS://Example.COM/Path/").as_deref(),
            Some("https://example.com/Path")
        );
        assert_eq!(
            canonical_url("https://example.com/").as_deref(),
            Some("https://example.com")
        );
    }

    #[test]
    fn canonical_url_drops_fragment_keeps_query() {
        assert_eq!(
            canonical_url("https://example.com/a?b=1#frag").as_deref(),
            Some("https://example.com/a?b=1")
        );
    }

    #[test]
    fn canonical_url_rejects_non_http() {
        assert_eq!(canonical_url("ftp://example.com/x"), None);
        assert_eq!(canonical_url("not a url"), None);
    }

    #[test]
    fn favicon_url_uses_hostname() {
        assert_eq!(
            favicon_url("https://docs.example.org/page"),
            "https://www.google.com/s2/favicons?domain=docs.example.org&sz=32"
        );
    }

    #[test]
    fn parses_serper_response_shape() {
        let js = r#"
        { "organic": [
            { "title": "T", "link": "https://example.com/", "snippet": "S", "date": "2024-01-01" },
            { "title": "U", "link": "https://other.org/x" }
        ] }
        "#;
        let parsed: SerperResponse = serde_json::from_str(js).unwrap();
        assert_eq!(parsed.organic.len(), 2);
        assert_eq!(parsed.organic[1].snippet, None);
    }
}
