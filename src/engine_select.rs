//! Intelligent engine selection for web ingestion.
//!
//! Picks the cheapest engine likely to succeed for a given URL, escalating
//! to a more expensive engine only after the cheaper ones fail. Domain-level
//! outcomes are remembered in-process for the lifetime of a crawl run so a
//! site that needed `headless` once doesn't retry `http` on every page.

use std::collections::HashMap;
use std::sync::Mutex;

use url::Url;

use crate::engines::{ScrapeEngine, ScrapeError, ScrapeResult};

/// Escalation order: cheapest/fastest first.
const ENGINE_ORDER: [&str; 3] = ["http", "headless", "managed"];

/// Domains known to require JS rendering or aggressive anti-bot measures;
/// consulted to skip straight past `http` instead of wasting a fetch on it.
fn js_heavy_hint(host: &str) -> bool {
    const HINTS: &[&str] = &[
        "twitter.com", "x.com", "linkedin.com", "instagram.com", "facebook.com",
    ];
    HINTS.iter().any(|h| host.ends_with(h))
}

pub struct EngineSelector {
    http: Box<dyn ScrapeEngine>,
    headless: Box<dyn ScrapeEngine>,
    managed: Box<dyn ScrapeEngine>,
    /// domain -> index into ENGINE_ORDER that last succeeded.
    domain_memory: Mutex<HashMap<String, usize>>,
}

impl EngineSelector {
    pub fn new(
        http: Box<dyn ScrapeEngine>,
        headless: Box<dyn ScrapeEngine>,
        managed: Box<dyn ScrapeEngine>,
    ) -> Self {
        Self {
            http,
            headless,
            managed,
            domain_memory: Mutex::new(HashMap::new()),
        }
    }

    fn engine_by_index(&self, idx: usize) -> &dyn ScrapeEngine {
        match ENGINE_ORDER[idx] {
            "http" => self.http.as_ref(),
            "headless" => self.headless.as_ref(),
            _ => self.managed.as_ref(),
        }
    }

    fn start_index(&self, url: &str) -> usize {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_string()))
            .unwrap_or_default();

        if let Some(&idx) = self.domain_memory.lock().unwrap().get(&host) {
            return idx;
        }
        if js_heavy_hint(&host) {
            return 1;
        }
        0
    }

    /// Fetch `url`, escalating through engines until one succeeds or all
    /// fail. Remembers the winning engine per-domain for subsequent calls.
    pub async fn fetch(&self, url: &str) -> Result<ScrapeResult, ScrapeError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_string()))
            .unwrap_or_default();

        let start = self.start_index(url);
        let mut last_err = None;

        for idx in start..ENGINE_ORDER.len() {
            match self.engine_by_index(idx).scrape(url).await {
                Ok(result) => {
                    if !result.text.trim().is_empty() {
                        self.domain_memory.lock().unwrap().insert(host, idx);
                        return Ok(result);
                    }
                    last_err = Some(ScrapeError::Managed(format!(
                        "engine '{}' returned empty content",
                        ENGINE_ORDER[idx]
                    )));
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| ScrapeError::EngineUnavailable("no engines configured".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_heavy_hint_matches_known_hosts() {
        assert!(js_heavy_hint("x.com"));
        assert!(js_heavy_hint("www.linkedin.com"));
        assert!(!js_heavy_hint("example.com"));
    }
}
