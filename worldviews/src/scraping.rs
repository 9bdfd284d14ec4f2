use anyhow::{Context, Result};
use reqwest::Client;
use scraper::{Html, Selector};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Given a source URL, produce the article body text (or nothing usable)
#[async_trait::async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Option<String>;
}

/// Selectors tried, in order, when readability finds nothing
const BODY_SELECTORS: &[&str] = &[
    "article",
    "[role=\"article\"]",
    ".article-body",
    ".article-content",
    ".story-body",
    ".post-content",
    ".entry-content",
    "main",
];

/// Paragraphs shorter than this are navigation, captions, bylines...
const MIN_PARAGRAPH_CHARS: usize = 50;

/// HTTP fetch + readability extraction, with CSS selector fallbacks
pub struct ReadabilityFetcher {
    client: Client,
    min_chars: usize,
}

impl ReadabilityFetcher {
    pub fn new(timeout_secs: u64, min_chars: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Mozilla/5.0 (compatible; Worldviews/0.1.0)")
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client, min_chars })
    }

    async fn download(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to fetch article page")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("article fetch failed with status: {}", status));
        }

        response.text().await.context("failed to read response body")
    }
}

#[async_trait::async_trait]
impl ContentFetcher for ReadabilityFetcher {
    async fn fetch(&self, url: &str) -> Option<String> {
        let html = match self.download(url).await {
            Ok(html) => html,
            Err(e) => {
                warn!(url, error = %format!("{:#}", e), "scraping: download failed");
                return None;
            }
        };

        let text = extract_text(&html, url)?;
        let chars = text.chars().count();
        if chars < self.min_chars {
            debug!(url, chars, "scraping: extracted text too short, ignoring it");
            return None;
        }
        info!(url, chars, "scraping: extracted article body");
        Some(text)
    }
}

/// Readability first; selector and paragraph heuristics when it fails or comes back empty
pub fn extract_text(html: &str, url: &str) -> Option<String> {
    if let Some(text) = readability_text(html, url) {
        return Some(text);
    }
    selector_text(html)
}

fn readability_text(html: &str, url: &str) -> Option<String> {
    let url_obj = url::Url::parse(url).ok()?;
    let mut reader = Cursor::new(html.as_bytes());

    let product = match readability::extractor::extract(&mut reader, &url_obj) {
        Ok(product) => product,
        Err(e) => {
            warn!(url, "scraping: readability failed: {}", e);
            return None;
        }
    };

    let text = match html2text::from_read(product.content.as_bytes(), 100) {
        Ok(text) => text,
        Err(e) => {
            warn!("scraping: failed to convert extracted HTML to text: {}", e);
            product.text
        }
    };

    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn selector_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    for raw in BODY_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else { continue };
        if let Some(node) = document.select(&selector).next() {
            let text = paragraphs(node.select(&paragraph_selector()?).map(|p| p.text().collect::<String>()));
            if !text.is_empty() {
                return Some(text);
            }
        }
    }

    let text = paragraphs(document.select(&paragraph_selector()?).map(|p| p.text().collect::<String>()));
    (!text.is_empty()).then_some(text)
}

fn paragraph_selector() -> Option<Selector> {
    Selector::parse("p").ok()
}

fn paragraphs(texts: impl Iterator<Item = String>) -> String {
    texts
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| t.len() > MIN_PARAGRAPH_CHARS)
        .collect::<Vec<_>>()
        .join("\n\n")
}
