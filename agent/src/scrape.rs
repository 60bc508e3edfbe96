use crate::{cache::ResultCache, search::canonical_url};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use thiserror::Error;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(8);
const MAX_CONTENT_CHARS: usize = 200_000;

#[derive(Debug, Error)]
#[error("scrape failed: {message}")]
pub struct ScrapeError {
    pub message: String,
    pub retryable: bool,
}

impl ScrapeError {
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

/// Readable content extracted from one page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageContent {
    pub content: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Per-URL result of a scrape, in the wire shape consumed by the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScrapeOutcome {
    #[must_use]
    pub fn ok(url: String, page: PageContent) -> Self {
        Self {
            url,
            success: true,
            data: Some(page.content),
            title: page.title,
            description: page.description,
            error: None,
        }
    }

    #[must_use]
    pub fn err(url: String, message: String) -> Self {
        Self {
            url,
            success: false,
            data: None,
            title: None,
            description: None,
            error: Some(message),
        }
    }
}

/// Result of a bulk scrape. `success` is false iff any URL failed; partial
/// failures never abort the bulk call.
#[derive(Debug, Clone)]
pub struct BulkScrapeResult {
    pub success: bool,
    pub results: Vec<ScrapeOutcome>,
}

#[async_trait::async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape_page(&self, url: &str) -> ScrapeOutcome;

    async fn scrape_pages(&self, urls: &[String]) -> BulkScrapeResult {
        let results =
            futures::future::join_all(urls.iter().map(|url| self.scrape_page(url))).await;
        BulkScrapeResult {
            success: results.iter().all(|r| r.success),
            results,
        }
    }
}

/// Fetches pages directly over HTTP with retry and extracts readable text.
/// Markdown and plain-text responses pass through; HTML is stripped down to
/// paragraph-level content. Successful fetches are cached by URL + options.
pub struct HttpScraper {
    client: reqwest::Client,
    cache: ResultCache,
    max_retries: usize,
}

impl HttpScraper {
    #[must_use]
    pub fn new(client: reqwest::Client, cache: ResultCache, max_retries: usize) -> Self {
        Self {
            client,
            cache,
            max_retries,
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<PageContent, ScrapeError> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(20))
            .send()
            .await
            .map_err(|e| ScrapeError::retryable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("HTTP {status}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ScrapeError::retryable(message)
            } else {
                ScrapeError::fatal(message)
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        let body = response
            .text()
            .await
            .map_err(|e| ScrapeError::retryable(e.to_string()))?;

        if content_type.starts_with("text/html") {
            Ok(extract_readable(&body))
        } else if content_type.starts_with("text/markdown")
            || content_type.starts_with("text/plain")
        {
            Ok(PageContent {
                content: body.chars().take(MAX_CONTENT_CHARS).collect(),
                title: None,
                description: None,
            })
        } else {
            Err(ScrapeError::fatal(format!(
                "unsupported content type: {content_type}"
            )))
        }
    }
}

#[async_trait::async_trait]
impl Scraper for HttpScraper {
    async fn scrape_page(&self, url: &str) -> ScrapeOutcome {
        let Some(canon) = canonical_url(url) else {
            return ScrapeOutcome::err(url.to_string(), "invalid url".to_string());
        };

        // Only successful fetches are written through; a transient failure
        // must not shadow the page for the full TTL.
        let fetched = self
            .cache
            .get_or_invoke("scrape", &(&canon, self.max_retries), || {
                retry_with_backoff(self.max_retries, || self.fetch_once(&canon))
            })
            .await;

        match fetched {
            Ok(page) => ScrapeOutcome::ok(canon, page),
            Err(error) => ScrapeOutcome::err(canon, error.message),
        }
    }
}

/// Run `f` up to `max_retries + 1` times, doubling the delay between attempts
/// from 500ms up to 8s. Fatal errors are returned immediately.
async fn retry_with_backoff<T, F, Fut>(max_retries: usize, mut f: F) -> Result<T, ScrapeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ScrapeError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) if error.retryable && attempt < max_retries => {
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn backoff_delay(attempt: usize) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(8) as u32);
    (BACKOFF_BASE * factor).min(BACKOFF_MAX)
}

/// Readable-text extraction: title, meta description, and paragraph-level
/// text. Selecting content elements keeps script and style text out.
fn extract_readable(html: &str) -> PageContent {
    let doc = Html::parse_document(html);

    let title_selector = Selector::parse("title").expect("static selector");
    let title = doc
        .select(&title_selector)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty());

    let meta_selector = Selector::parse("meta[name=description]").expect("static selector");
    let description = doc
        .select(&meta_selector)
        .next()
        .and_then(|m| m.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let content_selector =
        Selector::parse("h1, h2, h3, h4, h5, h6, p, li, td, th, pre, blockquote, figcaption")
            .expect("static selector");
    let mut content = String::new();
    for element in doc.select(&content_selector) {
        let text = element.text().collect::<String>();
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(text);
        if content.len() >= MAX_CONTENT_CHARS {
            content.truncate(MAX_CONTENT_CHARS);
            break;
        }
    }

    PageContent {
        content,
        title,
        description,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let mut attempts = 0usize;
        let result: Result<(), ScrapeError> = retry_with_backoff(2, || {
            attempts += 1;
            async { Err(ScrapeError::retryable("nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let mut attempts = 0usize;
        let result: Result<(), ScrapeError> = retry_with_backoff(3, || {
            attempts += 1;
            async { Err(ScrapeError::fatal("gone")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn bulk_scrape_contains_partial_failures() {
        let scraper = crate::testing::MockScraper::new();
        scraper.script("https://ok.example", "fine");

        let urls = vec![
            "https://ok.example".to_string(),
            "https://down.example".to_string(),
        ];
        let bulk = scraper.scrape_pages(&urls).await;

        assert!(!bulk.success);
        assert_eq!(bulk.results.len(), 2);
        assert!(bulk.results[0].success);
        assert!(!bulk.results[1].success);
        assert!(bulk.results[1].error.is_some());
    }

    #[test]
    fn extracts_title_description_and_paragraphs() {
        let html = r#"
        <html>
          <head>
            <title>Example Page</title>
            <meta name="description" content="A page about examples.">
            <script>var ignored = true;</script>
          </head>
          <body>
            <style>p { color: red; }</style>
            <h1>Heading</h1>
            <p>First paragraph.</p>
            <ul><li>Item one</li></ul>
          </body>
        </html>
        "#;

        let page = extract_readable(html);
        assert_eq!(page.title.as_deref(), Some("Example Page"));
        assert_eq!(page.description.as_deref(), Some("A page about examples."));
        assert!(page.content.contains("Heading"));
        assert!(page.content.contains("First paragraph."));
        assert!(page.content.contains("Item one"));
        assert!(!page.content.contains("ignored"));
        assert!(!page.content.contains("color: red"));
    }
}
