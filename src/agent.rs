//! Agentic crawl orchestrator: observe-think-act browser loop.
//!
//! Drives a multi-step research loop over the web: observe the current
//! page, ask an LLM what to do next (navigate, extract, or stop), act on
//! that decision, and repeat until the query is answered or a step/page
//! budget is exhausted. The "think" step calls an external chat-completions
//! model and must parse whatever JSON-ish text it returns — models routinely
//! wrap JSON in markdown fences or prose, so parsing tries several
//! strategies before giving up.

use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::engine_select::EngineSelector;
use crate::engines::ScrapeResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum AgentAction {
    Navigate { url: String },
    Extract { reason: String },
    Stop { answer: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStep {
    pub step_index: usize,
    pub url: String,
    pub action: AgentAction,
    pub vision_used: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRunResult {
    pub steps: Vec<AgentStep>,
    pub pages_visited: Vec<ScrapeResult>,
    pub final_answer: Option<String>,
    pub stopped_reason: String,
}

/// Keywords in the research question itself that suggest the answer lives
/// in an image, chart, or diagram rather than body text.
const VISION_KEYWORDS: [&str; 10] =
    ["image", "photo", "chart", "diagram", "graph", "screenshot", "figure", "picture", "visual", "infographic"];

/// URL path segments associated with long-form text content, where a vision
/// pass is rarely worth the cost even if the query mentions visual terms.
const CONTENT_PAGE_SEGMENTS: [&str; 7] = ["article", "post", "blog", "docs", "doc", "guide", "tutorial"];

/// Classify, once per task, whether the research question itself asks about
/// something visual. Run once up front rather than per step: the question
/// doesn't change as the agent navigates, so re-classifying it every step
/// would just waste cycles re-deriving the same answer.
pub fn query_requires_vision(query: &str) -> bool {
    let lower = query.to_lowercase();
    VISION_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn is_content_page_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    CONTENT_PAGE_SEGMENTS.iter().any(|seg| lower.contains(seg))
}

/// Decides, given the current page, step count, and whether the task's
/// question requires vision at all, whether this step should request a
/// vision-capable (screenshot) observation rather than a text-only one.
///
/// Gating order:
/// 1. Quota override: a page carrying 3 or more visual elements (images,
///    figures, embedded charts) gets a vision pass regardless of quota —
///    the page is declaring itself visual, not just the query.
/// 2. If the task's question never asked about anything visual, skip.
/// 3. Post-fetch false-positive check: if the page has already been
///    fetched and carries no visual elements at all, the query's vision
///    keywords didn't pan out for this page; skip rather than spend a
///    vision call on a page that can't answer it.
/// 4. A content-page URL (article/blog/docs path) is deprioritized even
///    when the query wants vision, since such pages are usually
///    illustrative rather than the visual source itself.
/// 5. Otherwise fall back to the quota: usage is capped at
///    `config.vision_quota` of total steps, with a small tolerance before
///    the cap is actually enforced.
pub fn should_use_vision(
    step_index: usize,
    vision_used_so_far: usize,
    current_url: &str,
    page: Option<&ScrapeResult>,
    task_requires_vision: bool,
    config: &AgentConfig,
) -> bool {
    if let Some(p) = page {
        if p.visual_element_count >= 3 {
            return true;
        }
    }

    if !task_requires_vision {
        return false;
    }

    if let Some(p) = page {
        if !p.has_visual_elements {
            return false;
        }
    }

    if is_content_page_url(current_url) {
        return false;
    }

    if step_index == 0 {
        return true;
    }

    let ratio = vision_used_so_far as f64 / step_index as f64;
    ratio < config.vision_quota + config.vision_quota_tolerance
}

/// Think step: call an LLM chat-completion endpoint with the current
/// observation and ask it to decide the next [`AgentAction`] as JSON.
/// Caller supplies the already-rendered prompt; this function only owns the
/// HTTP call and the response parsing.
pub async fn think(
    client: &reqwest::Client,
    chat_url: &str,
    api_key: Option<&str>,
    model: &str,
    prompt: &str,
) -> anyhow::Result<AgentAction> {
    let mut req = client.post(chat_url).json(&serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
        "temperature": 0.0,
    }));
    if let Some(key) = api_key {
        req = req.header("Authorization", format!("Bearer {}", key));
    }

    let resp = req.send().await?;
    let body: serde_json::Value = resp.json().await?;
    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default();

    parse_agent_action(content)
}

/// Multi-strategy JSON parsing for LLM output: try, in order, a fenced code
/// block, a brace-to-matching-brace slice, a non-greedy regex, a greedy
/// regex, and finally treat the whole text as JSON. Each strategy is
/// progressively more permissive (and more likely to grab garbage), so they
/// run in order of precision.
pub fn parse_agent_action(text: &str) -> anyhow::Result<AgentAction> {
    let candidates = [
        extract_fenced_code_block(text),
        extract_matching_braces(text),
        extract_regex_non_greedy(text),
        extract_regex_greedy(text),
        Some(text.to_string()),
    ];

    let mut last_err = None;
    for candidate in candidates.into_iter().flatten() {
        match serde_json::from_str::<AgentAction>(candidate.trim()) {
            Ok(action) => return Ok(action),
            Err(e) => last_err = Some(e),
        }
    }

    Err(anyhow::anyhow!(
        "could not parse an agent action from model output: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

fn extract_fenced_code_block(text: &str) -> Option<String> {
    let re = regex::Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap();
    re.captures(text).map(|c| c[1].to_string())
}

fn extract_matching_braces(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_regex_non_greedy(text: &str) -> Option<String> {
    let re = regex::Regex::new(r"\{.*?\}").ok()?;
    re.find(text).map(|m| m.as_str().to_string())
}

fn extract_regex_greedy(text: &str) -> Option<String> {
    let re = regex::Regex::new(r"\{.*\}").ok()?;
    re.find(text).map(|m| m.as_str().to_string())
}

/// Run the observe-think-act loop starting from `start_url` until the model
/// returns `Stop`, or `config.max_depth`/`config.max_pages` is reached.
pub async fn run_agent_loop(
    selector: &EngineSelector,
    config: &AgentConfig,
    start_url: &str,
    query: &str,
    think_fn: impl Fn(&str, &str, &[ScrapeResult]) -> AgentAction,
) -> AgentRunResult {
    let mut steps = Vec::new();
    let mut pages = Vec::new();
    let mut current_url = start_url.to_string();
    let mut final_answer = None;
    let mut stopped_reason = "max_pages_reached".to_string();
    let mut vision_used = 0usize;
    let task_requires_vision = query_requires_vision(query);

    for step_index in 0..config.max_pages.max(0) as usize {
        let page = match selector.fetch(&current_url).await {
            Ok(p) => p,
            Err(e) => {
                stopped_reason = format!("fetch_error: {}", e);
                break;
            }
        };

        let use_vision = should_use_vision(step_index, vision_used, &current_url, Some(&page), task_requires_vision, config);
        if use_vision {
            vision_used += 1;
        }

        let action = think_fn(query, &current_url, &pages);
        pages.push(page.clone());

        steps.push(AgentStep {
            step_index,
            url: current_url.clone(),
            action: action.clone(),
            vision_used: use_vision,
        });

        match action {
            AgentAction::Navigate { url } => {
                current_url = url;
            }
            AgentAction::Extract { .. } => {
                // Stay on the same page for an explicit extraction pass;
                // the caller reads `pages` after the loop finishes.
                continue;
            }
            AgentAction::Stop { answer } => {
                final_answer = Some(answer);
                stopped_reason = "model_stop".to_string();
                break;
            }
        }
    }

    AgentRunResult {
        steps,
        pages_visited: pages,
        final_answer,
        stopped_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let text = "Sure, here you go:\n```json\n{\"action\": \"stop\", \"answer\": \"42\"}\n```";
        let action = parse_agent_action(text).unwrap();
        assert!(matches!(action, AgentAction::Stop { answer } if answer == "42"));
    }

    #[test]
    fn parses_bare_json_with_prose_around_it() {
        let text = "The next step is {\"action\": \"navigate\", \"url\": \"https://x.test\"} based on the page.";
        let action = parse_agent_action(text).unwrap();
        assert!(matches!(action, AgentAction::Navigate { url } if url == "https://x.test"));
    }

    fn scrape_result_with_visuals(count: usize) -> ScrapeResult {
        ScrapeResult {
            url: "https://x.test/chart".to_string(),
            final_url: "https://x.test/chart".to_string(),
            status: 200,
            html: None,
            text: "some text".to_string(),
            title: None,
            links: vec![],
            engine: "http".to_string(),
            rendered_js: false,
            visual_element_count: count,
            has_visual_elements: count > 0,
        }
    }

    #[test]
    fn vision_quota_skips_when_task_does_not_require_vision() {
        let config = AgentConfig::default();
        let page = scrape_result_with_visuals(1);
        assert!(!should_use_vision(0, 0, "https://x.test/chart", Some(&page), false, &config));
    }

    #[test]
    fn vision_quota_enforced_after_tolerance() {
        let mut config = AgentConfig::default();
        config.vision_quota = 0.1;
        config.vision_quota_tolerance = 0.0;
        let page = scrape_result_with_visuals(1);
        assert!(!should_use_vision(10, 5, "https://x.test/chart", Some(&page), true, &config));
    }

    #[test]
    fn vision_quota_override_on_high_visual_density() {
        let mut config = AgentConfig::default();
        config.vision_quota = 0.0;
        config.vision_quota_tolerance = 0.0;
        let page = scrape_result_with_visuals(3);
        assert!(should_use_vision(10, 10, "https://x.test/chart", Some(&page), false, &config));
    }

    #[test]
    fn vision_quota_false_positive_skips_page_with_no_visuals() {
        let config = AgentConfig::default();
        let page = scrape_result_with_visuals(0);
        assert!(!should_use_vision(0, 0, "https://x.test/chart", Some(&page), true, &config));
    }

    #[test]
    fn vision_quota_deprioritizes_content_pages() {
        let config = AgentConfig::default();
        let page = scrape_result_with_visuals(1);
        assert!(!should_use_vision(0, 0, "https://x.test/blog/post-1", Some(&page), true, &config));
    }

    #[test]
    fn vision_quota_allows_first_step_when_task_requires_vision() {
        let config = AgentConfig::default();
        let page = scrape_result_with_visuals(1);
        assert!(should_use_vision(0, 0, "https://x.test/chart", Some(&page), true, &config));
    }

    #[test]
    fn query_requires_vision_detects_keyword() {
        assert!(query_requires_vision("What does the chart on this page show?"));
        assert!(!query_requires_vision("What is the capital of France?"));
    }
}
