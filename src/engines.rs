//! Web scraping engines behind a uniform contract.
//!
//! Three engines trade off cost, speed, and JS-rendering capability:
//! - [`HttpEngine`] — plain `reqwest` GET + HTML parse. Fast, cheap, fails on
//!   JS-rendered pages.
//! - [`HeadlessEngine`] — drives a real Chromium instance via `chromiumoxide`
//!   (feature-gated). Handles JS rendering at the cost of a cold-start.
//! - [`ManagedEngine`] — delegates to a managed scraping API (anti-bot
//!   evasion, proxy rotation) for sites the first two can't reach.
//!
//! All three return a [`ScrapeResult`] so the engine selector and crawler can
//! treat them interchangeably.

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeResult {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub html: Option<String>,
    pub text: String,
    pub title: Option<String>,
    pub links: Vec<String>,
    pub engine: String,
    pub rendered_js: bool,
    /// Count of `img`/`svg`/`canvas`/`video`/`picture`/`figure` elements found
    /// in the page's HTML. Zero when no HTML was captured (e.g. managed-engine
    /// responses that only returned markdown).
    pub visual_element_count: usize,
    pub has_visual_elements: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("non-success status {status} fetching {url}")]
    Status { url: String, status: u16 },
    #[error("engine '{0}' is not available in this build")]
    EngineUnavailable(String),
    #[error("managed engine error: {0}")]
    Managed(String),
}

#[async_trait]
pub trait ScrapeEngine: Send + Sync {
    fn name(&self) -> &'static str;
    async fn scrape(&self, url: &str) -> Result<ScrapeResult, ScrapeError>;
}

/// Counts elements likely to carry visual information worth a screenshot
/// capture: images, inline vector graphics, canvases, video, and figures.
fn count_visual_elements(html: &str) -> usize {
    use scraper::{Html, Selector};

    let document = Html::parse_document(html);
    let sel = Selector::parse("img, svg, canvas, video, picture, figure").unwrap();
    document.select(&sel).count()
}

/// Parse HTML into plain text, a title, and outgoing links, shared by every
/// engine that returns raw HTML.
fn parse_html(url: &str, html: &str) -> (String, Option<String>, Vec<String>) {
    use scraper::{Html, Selector};

    let document = Html::parse_document(html);

    let title_sel = Selector::parse("title").unwrap();
    let title = document
        .select(&title_sel)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty());

    let body_sel = Selector::parse("body").unwrap();
    let text = document
        .select(&body_sel)
        .next()
        .map(|b| {
            b.text()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    let link_sel = Selector::parse("a[href]").unwrap();
    let base = url::Url::parse(url).ok();
    let links = document
        .select(&link_sel)
        .filter_map(|e| e.value().attr("href"))
        .filter_map(|href| match &base {
            Some(b) => b.join(href).ok().map(|u| u.to_string()),
            None => Some(href.to_string()),
        })
        .collect();

    (text, title, links)
}

// ============ HTTP engine ============

pub struct HttpEngine {
    client: reqwest::Client,
}

impl HttpEngine {
    pub fn new(timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .user_agent("Mozilla/5.0 (compatible; knowledgetree-core/0.1)")
            .build()
            .expect("reqwest client build");
        Self { client }
    }
}

#[async_trait]
impl ScrapeEngine for HttpEngine {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn scrape(&self, url: &str) -> Result<ScrapeResult, ScrapeError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScrapeError::Network {
                url: url.to_string(),
                source: e,
            })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(ScrapeError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let html = resp.text().await.map_err(|e| ScrapeError::Network {
            url: url.to_string(),
            source: e,
        })?;
        let (text, title, links) = parse_html(&final_url, &html);
        let visual_element_count = count_visual_elements(&html);

        Ok(ScrapeResult {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            html: Some(html),
            text,
            title,
            links,
            engine: "http".to_string(),
            rendered_js: false,
            visual_element_count,
            has_visual_elements: visual_element_count > 0,
        })
    }
}

// ============ Headless browser engine ============

#[cfg(feature = "headless-engine")]
pub struct HeadlessEngine {
    navigation_timeout_secs: u64,
}

#[cfg(feature = "headless-engine")]
impl HeadlessEngine {
    pub fn new(navigation_timeout_secs: u64) -> Self {
        Self {
            navigation_timeout_secs,
        }
    }
}

#[cfg(feature = "headless-engine")]
#[async_trait]
impl ScrapeEngine for HeadlessEngine {
    fn name(&self) -> &'static str {
        "headless"
    }

    async fn scrape(&self, url: &str) -> Result<ScrapeResult, ScrapeError> {
        use chromiumoxide::{Browser, BrowserConfig};
        use futures::StreamExt;

        let (browser, mut handler) = Browser::launch(
            BrowserConfig::builder()
                .build()
                .map_err(|e| ScrapeError::Managed(e.to_string()))?,
        )
        .await
        .map_err(|e| ScrapeError::Managed(e.to_string()))?;

        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = browser
            .new_page(url)
            .await
            .map_err(|e| ScrapeError::Managed(e.to_string()))?;

        tokio::time::timeout(
            std::time::Duration::from_secs(self.navigation_timeout_secs),
            page.wait_for_navigation(),
        )
        .await
        .map_err(|_| ScrapeError::Managed("navigation timed out".to_string()))?
        .map_err(|e| ScrapeError::Managed(e.to_string()))?;

        let html = page
            .content()
            .await
            .map_err(|e| ScrapeError::Managed(e.to_string()))?;
        let final_url = page
            .url()
            .await
            .map_err(|e| ScrapeError::Managed(e.to_string()))?
            .unwrap_or_else(|| url.to_string());

        let (text, title, links) = parse_html(&final_url, &html);
        let visual_element_count = count_visual_elements(&html);
        handler_task.abort();

        Ok(ScrapeResult {
            url: url.to_string(),
            final_url,
            status: 200,
            html: Some(html),
            text,
            title,
            links,
            engine: "headless".to_string(),
            rendered_js: true,
            visual_element_count,
            has_visual_elements: visual_element_count > 0,
        })
    }
}

#[cfg(not(feature = "headless-engine"))]
pub struct HeadlessEngine;

#[cfg(not(feature = "headless-engine"))]
impl HeadlessEngine {
    pub fn new(_navigation_timeout_secs: u64) -> Self {
        Self
    }
}

#[cfg(not(feature = "headless-engine"))]
#[async_trait]
impl ScrapeEngine for HeadlessEngine {
    fn name(&self) -> &'static str {
        "headless"
    }

    async fn scrape(&self, _url: &str) -> Result<ScrapeResult, ScrapeError> {
        Err(ScrapeError::EngineUnavailable(
            "headless (build without --features headless-engine)".to_string(),
        ))
    }
}

// ============ Managed remote engine ============

pub struct ManagedEngine {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl ManagedEngine {
    pub fn new(api_key: Option<String>, base_url: Option<String>, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_secs))
                .build()
                .expect("reqwest client build"),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.firecrawl.dev/v1".to_string()),
        }
    }
}

#[async_trait]
impl ScrapeEngine for ManagedEngine {
    fn name(&self) -> &'static str {
        "managed"
    }

    async fn scrape(&self, url: &str) -> Result<ScrapeResult, ScrapeError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ScrapeError::Managed("no API key configured".to_string()))?;

        let resp = self
            .client
            .post(format!("{}/scrape", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&serde_json::json!({ "url": url, "formats": ["markdown", "html", "links"] }))
            .send()
            .await
            .map_err(|e| ScrapeError::Network {
                url: url.to_string(),
                source: e,
            })?;

        if !resp.status().is_success() {
            return Err(ScrapeError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ScrapeError::Network {
                url: url.to_string(),
                source: e,
            })?;

        let data = body.get("data").unwrap_or(&body);
        let text = data
            .get("markdown")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let html = data.get("html").and_then(|v| v.as_str()).map(|s| s.to_string());
        let title = data
            .get("metadata")
            .and_then(|m| m.get("title"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let links = data
            .get("links")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let visual_element_count = html.as_deref().map(count_visual_elements).unwrap_or(0);

        Ok(ScrapeResult {
            url: url.to_string(),
            final_url: url.to_string(),
            status: 200,
            html,
            text,
            title,
            links,
            engine: "managed".to_string(),
            rendered_js: true,
            visual_element_count,
            has_visual_elements: visual_element_count > 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_html_extracts_title_text_links() {
        let html = r#"<html><head><title>Hi</title></head>
            <body><p>Hello world</p><a href="/next">next</a></body></html>"#;
        let (text, title, links) = parse_html("https://example.com/page", html);
        assert_eq!(title.as_deref(), Some("Hi"));
        assert!(text.contains("Hello world"));
        assert_eq!(links, vec!["https://example.com/next".to_string()]);
    }
}
