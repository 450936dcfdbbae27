//! Crawl job orchestration: breadth-first link traversal bounded by depth
//! and page count, feeding scraped pages into the ingestion worker.

use std::collections::{HashSet, VecDeque};

use anyhow::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::Config;
use crate::engine_select::EngineSelector;
use crate::engines::{HeadlessEngine, HttpEngine, ManagedEngine, ScrapeResult};
use crate::models::CrawlJob;

pub fn build_engine_selector(config: &Config) -> EngineSelector {
    EngineSelector::new(
        Box::new(HttpEngine::new(config.embedding.timeout_secs)),
        Box::new(HeadlessEngine::new(30)),
        Box::new(ManagedEngine::new(
            config.scraping.managed_api_key.clone(),
            config.scraping.managed_base_url.clone(),
            60,
        )),
    )
}

/// Create and persist a new crawl job row in `pending` state.
pub async fn create_crawl_job(
    pool: &SqlitePool,
    project_id: &str,
    url: &str,
    max_depth: i64,
    max_pages: i64,
    engine: Option<&str>,
) -> Result<CrawlJob> {
    let now = chrono::Utc::now().timestamp();
    let job = CrawlJob {
        id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        url: url.to_string(),
        max_depth,
        max_pages,
        engine: engine.map(|s| s.to_string()),
        status: "pending".to_string(),
        urls_crawled: 0,
        urls_failed: 0,
        document_id: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO crawl_jobs
            (id, project_id, url, max_depth, max_pages, engine, status,
             urls_crawled, urls_failed, document_id, error_message, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(&job.project_id)
    .bind(&job.url)
    .bind(job.max_depth)
    .bind(job.max_pages)
    .bind(&job.engine)
    .bind(&job.status)
    .bind(job.urls_crawled)
    .bind(job.urls_failed)
    .bind(&job.document_id)
    .bind(&job.error_message)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(job)
}

/// Breadth-first crawl starting at `job.url`, bounded by `max_depth` and
/// `max_pages`. Returns every page successfully scraped; failures are
/// counted but do not abort the crawl.
pub async fn run_crawl(
    selector: &EngineSelector,
    job: &CrawlJob,
    politeness_delay_ms: u64,
) -> (Vec<ScrapeResult>, u64, u64) {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back((job.url.clone(), 0i64));
    visited.insert(job.url.clone());

    let mut pages = Vec::new();
    let mut crawled = 0u64;
    let mut failed = 0u64;

    while let Some((url, depth)) = queue.pop_front() {
        if crawled + failed >= job.max_pages as u64 {
            break;
        }

        match selector.fetch(&url).await {
            Ok(page) => {
                crawled += 1;
                if depth < job.max_depth {
                    for link in same_host_links(&job.url, &page.links) {
                        if visited.insert(link.clone()) {
                            queue.push_back((link, depth + 1));
                        }
                    }
                }
                pages.push(page);
            }
            Err(_) => {
                failed += 1;
            }
        }

        if politeness_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(politeness_delay_ms)).await;
        }
    }

    (pages, crawled, failed)
}

/// Filter `links` to those sharing a host with `origin`, so a crawl of one
/// site doesn't wander across the open web.
fn same_host_links(origin: &str, links: &[String]) -> Vec<String> {
    let origin_host = url::Url::parse(origin).ok().and_then(|u| u.host_str().map(|s| s.to_string()));
    links
        .iter()
        .filter(|link| {
            url::Url::parse(link)
                .ok()
                .and_then(|u| u.host_str().map(|s| s.to_string()))
                == origin_host
        })
        .cloned()
        .collect()
}

pub async fn update_crawl_job_status(
    pool: &SqlitePool,
    job_id: &str,
    status: &str,
    urls_crawled: i64,
    urls_failed: i64,
    document_id: Option<&str>,
    error_message: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        UPDATE crawl_jobs
        SET status = ?, urls_crawled = ?, urls_failed = ?, document_id = ?,
            error_message = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status)
    .bind(urls_crawled)
    .bind(urls_failed)
    .bind(document_id)
    .bind(error_message)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_host_links_filters_cross_domain() {
        let links = vec![
            "https://example.com/a".to_string(),
            "https://other.com/b".to_string(),
        ];
        let filtered = same_host_links("https://example.com/start", &links);
        assert_eq!(filtered, vec!["https://example.com/a".to_string()]);
    }
}
