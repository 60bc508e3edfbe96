//! Scriptable fakes for the loop's I/O seams, used by the crate's own tests
//! and by embedders wiring the agent into their own test harnesses.

use crate::{
    scrape::{PageContent, ScrapeOutcome, Scraper},
    search::{SearchError, SearchHit, SearchProvider},
};
use std::{
    collections::HashMap,
    sync::Mutex,
};

/// Search provider that answers from a scripted query table and records the
/// queries it saw.
#[derive(Default)]
pub struct MockSearchProvider {
    responses: Mutex<HashMap<String, Result<Vec<SearchHit>, String>>>,
    calls: Mutex<Vec<String>>,
}

impl MockSearchProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, query: &str, hits: Vec<SearchHit>) -> &Self {
        self.responses
            .lock()
            .expect("mock state poisoned")
            .insert(query.to_string(), Ok(hits));
        self
    }

    pub fn script_error(&self, query: &str, message: &str) -> &Self {
        self.responses
            .lock()
            .expect("mock state poisoned")
            .insert(query.to_string(), Err(message.to_string()));
        self
    }

    pub fn recorded_queries(&self) -> Vec<String> {
        self.calls.lock().expect("mock state poisoned").clone()
    }
}

#[async_trait::async_trait]
impl SearchProvider for MockSearchProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn search(&self, query: &str, num: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.calls
            .lock()
            .expect("mock state poisoned")
            .push(query.to_string());

        let scripted = self
            .responses
            .lock()
            .expect("mock state poisoned")
            .get(query)
            .cloned();

        match scripted {
            Some(Ok(hits)) => Ok(hits.into_iter().take(num.clamp(1, 10)).collect()),
            Some(Err(message)) => Err(SearchError {
                message,
                retryable: false,
            }),
            None => Ok(Vec::new()),
        }
    }
}

/// Scraper that serves scripted page content by URL. Unscripted URLs fail,
/// matching a fetch error in production.
#[derive(Default)]
pub struct MockScraper {
    pages: Mutex<HashMap<String, PageContent>>,
    calls: Mutex<Vec<String>>,
}

impl MockScraper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: &str, content: &str) -> &Self {
        self.pages.lock().expect("mock state poisoned").insert(
            url.to_string(),
            PageContent {
                content: content.to_string(),
                title: None,
                description: None,
            },
        );
        self
    }

    pub fn recorded_urls(&self) -> Vec<String> {
        self.calls.lock().expect("mock state poisoned").clone()
    }
}

#[async_trait::async_trait]
impl Scraper for MockScraper {
    async fn scrape_page(&self, url: &str) -> ScrapeOutcome {
        self.calls
            .lock()
            .expect("mock state poisoned")
            .push(url.to_string());

        let page = self
            .pages
            .lock()
            .expect("mock state poisoned")
            .get(url)
            .cloned();

        match page {
            Some(page) => ScrapeOutcome::ok(url.to_string(), page),
            None => ScrapeOutcome::err(url.to_string(), "connection refused".to_string()),
        }
    }
}

/// A search hit with plausible defaults for tests.
#[must_use]
pub fn hit(url: &str, title: &str, snippet: &str) -> SearchHit {
    SearchHit {
        title: title.to_string(),
        url: url.to_string(),
        snippet: snippet.to_string(),
        date: "2025-06-01".to_string(),
    }
}
