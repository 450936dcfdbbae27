//! Ingestion worker: the orchestration that turns a raw source (PDF bytes,
//! a block of text, a single web page, or a crawl job) into a fully indexed
//! [`Document`] — classified, extracted, chunked, embedded, and FTS-indexed.
//!
//! Each entry point follows the same shape: create/load the document row in
//! `processing` state, run the source-specific pipeline while emitting
//! [`IngestionEvent`]s through the caller's reporter, then flip the document
//! to `completed` or `failed`. Chunk/FTS/embedding writes are idempotent —
//! re-running ingestion for the same document replaces its chunks rather
//! than appending to them, so a retried job never double-counts content.

use anyhow::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::classifier;
use crate::config::Config;
use crate::crawl::{self, build_engine_selector};
use crate::embed_cmd::embed_chunks_inline;
use crate::engine_select::EngineSelector;
use crate::engines::ScrapeResult;
use crate::extract::{self, ExtractError};
use crate::models::{Chunk, Document};
use crate::progress::{IngestionEvent, IngestionProgressReporter, IngestionStep};

/// Create a new document row in `pending` state for `project_id`, returning
/// it with a freshly minted id.
async fn create_document(
    pool: &SqlitePool,
    project_id: &str,
    title: Option<&str>,
    source_kind: &str,
    source_locator: &str,
) -> Result<Document> {
    let now = chrono::Utc::now().timestamp();
    let doc = Document {
        id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        title: title.map(|s| s.to_string()),
        source_kind: source_kind.to_string(),
        source_locator: source_locator.to_string(),
        state: "pending".to_string(),
        page_count: None,
        error_message: None,
        extraction_metadata: serde_json::json!({}),
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO documents
            (id, project_id, title, source_kind, source_locator, state, page_count,
             error_message, extraction_metadata, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(project_id, source_locator) DO UPDATE SET
            title = excluded.title,
            state = 'pending',
            error_message = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.project_id)
    .bind(&doc.title)
    .bind(&doc.source_kind)
    .bind(&doc.source_locator)
    .bind(&doc.state)
    .bind(doc.page_count)
    .bind(&doc.error_message)
    .bind(doc.extraction_metadata.to_string())
    .bind(doc.created_at)
    .bind(doc.updated_at)
    .execute(pool)
    .await?;

    // A conflict reuses the existing row's id rather than `doc.id`; reload
    // by (project_id, source_locator) so the caller always gets the live id.
    let id: String = sqlx::query_scalar(
        "SELECT id FROM documents WHERE project_id = ? AND source_locator = ?",
    )
    .bind(project_id)
    .bind(source_locator)
    .fetch_one(pool)
    .await?;

    Ok(Document { id, ..doc })
}

async fn set_document_state(
    pool: &SqlitePool,
    document_id: &str,
    state: &str,
    error_message: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE documents SET state = ?, error_message = ?, updated_at = ? WHERE id = ?",
    )
    .bind(state)
    .bind(error_message)
    .bind(now)
    .bind(document_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn set_document_metadata(
    pool: &SqlitePool,
    document_id: &str,
    page_count: Option<i64>,
    extraction_metadata: &serde_json::Value,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE documents SET page_count = ?, extraction_metadata = ?, updated_at = ? WHERE id = ?",
    )
    .bind(page_count)
    .bind(extraction_metadata.to_string())
    .bind(now)
    .bind(document_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace a document's chunks (and their FTS entries and embeddings) with a
/// freshly computed set. Idempotent: safe to call again for the same
/// document after a retry.
async fn replace_chunks(pool: &SqlitePool, document_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM chunk_vectors WHERE document_id = ?",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, chunk_index, text, before, after, metadata, hash, has_embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.before)
        .bind(&chunk.after)
        .bind(chunk.metadata.to_string())
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(document_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

fn emit(reporter: &dyn IngestionProgressReporter, job_id: &str, step: IngestionStep, percent: u8) {
    reporter.report(IngestionEvent::new(job_id, step, percent));
}

/// Ingest raw PDF bytes: classify, extract, chunk, embed, index.
pub async fn ingest_pdf(
    config: &Config,
    pool: &SqlitePool,
    reporter: &dyn IngestionProgressReporter,
    project_id: &str,
    source_locator: &str,
    title: Option<&str>,
    bytes: &[u8],
) -> Result<Document> {
    let doc = create_document(pool, project_id, title, "pdf", source_locator).await?;
    set_document_state(pool, &doc.id, "processing", None).await?;

    emit(reporter, &doc.id, IngestionStep::Classifying, 5);

    let text = match extract::extract_pdf(bytes) {
        Ok(t) => t,
        Err(e) => {
            let msg = format_extract_error(&e);
            set_document_state(pool, &doc.id, "failed", Some(&msg)).await?;
            anyhow::bail!("PDF extraction failed for {}: {}", source_locator, msg);
        }
    };

    let classification = classifier::classify_document(&text, doc.page_count);
    emit(reporter, &doc.id, IngestionStep::Classifying, 10);

    emit(reporter, &doc.id, IngestionStep::Extracting, 25);
    let extraction_metadata = serde_json::json!({
        "document_type": classification.doc_type.as_str(),
        "classification_confidence": classification.confidence,
        "classification_reasoning": classification.reasoning,
        "classification_features": classification.features,
        "extraction_chars": text.len(),
    });
    set_document_metadata(pool, &doc.id, doc.page_count, &extraction_metadata).await?;
    emit(reporter, &doc.id, IngestionStep::Extracting, 40);

    let result = finish_ingestion(config, pool, reporter, &doc.id, &text).await;
    finalize(pool, &doc.id, reporter, result).await
}

/// Ingest a block of already-extracted plain text (e.g. a YouTube transcript
/// or a user-pasted note) directly into the chunk/embed/index pipeline.
pub async fn ingest_text(
    config: &Config,
    pool: &SqlitePool,
    reporter: &dyn IngestionProgressReporter,
    project_id: &str,
    source_kind: &str,
    source_locator: &str,
    title: Option<&str>,
    text: &str,
) -> Result<Document> {
    let doc = create_document(pool, project_id, title, source_kind, source_locator).await?;
    set_document_state(pool, &doc.id, "processing", None).await?;
    emit(reporter, &doc.id, IngestionStep::Chunking, 40);

    let result = finish_ingestion(config, pool, reporter, &doc.id, text).await;
    finalize(pool, &doc.id, reporter, result).await
}

/// Ingest a single web page: fetch it through the engine selector, then run
/// the shared chunk/embed/index pipeline over its extracted text.
pub async fn ingest_web_page(
    config: &Config,
    pool: &SqlitePool,
    reporter: &dyn IngestionProgressReporter,
    selector: &EngineSelector,
    project_id: &str,
    url: &str,
) -> Result<Document> {
    let doc = create_document(pool, project_id, None, "web", url).await?;
    set_document_state(pool, &doc.id, "processing", None).await?;
    emit(reporter, &doc.id, IngestionStep::Crawling, 10);

    let page = match selector.fetch(url).await {
        Ok(p) => p,
        Err(e) => {
            let msg = e.to_string();
            set_document_state(pool, &doc.id, "failed", Some(&msg)).await?;
            anyhow::bail!("fetch failed for {}: {}", url, msg);
        }
    };

    emit(reporter, &doc.id, IngestionStep::Crawling, 30);
    let extraction_metadata = serde_json::json!({
        "engine": page.engine,
        "rendered_js": page.rendered_js,
        "final_url": page.final_url,
        "status": page.status,
        "title": page.title,
    });
    set_document_metadata(pool, &doc.id, None, &extraction_metadata).await?;

    let result = finish_ingestion(config, pool, reporter, &doc.id, &page.text).await;
    finalize(pool, &doc.id, reporter, result).await
}

/// Run a multi-page crawl job to completion and ingest every visited page's
/// text as a single concatenated document, linked back to the job row.
pub async fn ingest_crawl_job(
    config: &Config,
    pool: &SqlitePool,
    reporter: &dyn IngestionProgressReporter,
    selector: &EngineSelector,
    job: &crate::models::CrawlJob,
) -> Result<Document> {
    emit(reporter, &job.id, IngestionStep::Crawling, 5);
    let (pages, crawled, failed) = crawl::run_crawl(selector, job, config.agent.politeness_delay_ms).await;
    emit(reporter, &job.id, IngestionStep::Crawling, 40);

    if pages.is_empty() {
        let msg = format!("crawl of {} visited no pages ({} failed)", job.url, failed);
        crawl::update_crawl_job_status(pool, &job.id, "failed", crawled as i64, failed as i64, None, Some(&msg))
            .await?;
        anyhow::bail!(msg);
    }

    let doc = create_document(pool, &job.project_id, None, "web", &job.url).await?;
    set_document_state(pool, &doc.id, "processing", None).await?;

    let combined_text = combine_pages(&pages);
    let extraction_metadata = serde_json::json!({
        "pages_crawled": crawled,
        "pages_failed": failed,
        "page_urls": pages.iter().map(|p| p.url.clone()).collect::<Vec<_>>(),
    });
    set_document_metadata(pool, &doc.id, Some(pages.len() as i64), &extraction_metadata).await?;

    let result = finish_ingestion(config, pool, reporter, &doc.id, &combined_text).await;
    let finalized = finalize(pool, &doc.id, reporter, result).await;

    match &finalized {
        Ok(_) => {
            crawl::update_crawl_job_status(
                pool,
                &job.id,
                "completed",
                crawled as i64,
                failed as i64,
                Some(&doc.id),
                None,
            )
            .await?;
        }
        Err(e) => {
            crawl::update_crawl_job_status(
                pool,
                &job.id,
                "failed",
                crawled as i64,
                failed as i64,
                Some(&doc.id),
                Some(&e.to_string()),
            )
            .await?;
        }
    }

    finalized
}

fn combine_pages(pages: &[ScrapeResult]) -> String {
    let mut out = String::new();
    for page in pages {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        if let Some(title) = &page.title {
            out.push_str(title);
            out.push('\n');
        }
        out.push_str(&page.text);
    }
    out
}

/// The shared tail of every ingestion path: chunk the extracted text,
/// replace the document's chunks, embed them inline, and emit the
/// chunking/embedding/indexing progress window.
async fn finish_ingestion(
    config: &Config,
    pool: &SqlitePool,
    reporter: &dyn IngestionProgressReporter,
    document_id: &str,
    text: &str,
) -> Result<(usize, u64, u64)> {
    emit(reporter, document_id, IngestionStep::Chunking, 45);
    let chunks = chunk_text(
        document_id,
        text,
        config.chunking.chunk_size,
        config.chunking.chunk_overlap,
    );
    replace_chunks(pool, document_id, &chunks).await?;
    emit(reporter, document_id, IngestionStep::Chunking, 60);

    emit(reporter, document_id, IngestionStep::Embedding, 65);
    let (embedded, failed) = embed_chunks_inline(config, pool, &chunks).await;
    emit(reporter, document_id, IngestionStep::Embedding, 90);

    emit(reporter, document_id, IngestionStep::Indexing, 95);
    Ok((chunks.len(), embedded, failed))
}

async fn finalize(
    pool: &SqlitePool,
    document_id: &str,
    reporter: &dyn IngestionProgressReporter,
    result: Result<(usize, u64, u64)>,
) -> Result<Document> {
    match result {
        Ok((chunk_count, embedded, failed)) => {
            set_document_state(pool, document_id, "completed", None).await?;
            emit(reporter, document_id, IngestionStep::Done, 100);
            let _ = (chunk_count, embedded, failed);
            load_document(pool, document_id).await
        }
        Err(e) => {
            set_document_state(pool, document_id, "failed", Some(&e.to_string())).await?;
            Err(e)
        }
    }
}

async fn load_document(pool: &SqlitePool, document_id: &str) -> Result<Document> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT id, project_id, title, source_kind, source_locator, state, page_count,
               error_message, extraction_metadata, created_at, updated_at
        FROM documents WHERE id = ?
        "#,
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    project_id: String,
    title: Option<String>,
    source_kind: String,
    source_locator: String,
    state: String,
    page_count: Option<i64>,
    error_message: Option<String>,
    extraction_metadata: String,
    created_at: i64,
    updated_at: i64,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            id: row.id,
            project_id: row.project_id,
            title: row.title,
            source_kind: row.source_kind,
            source_locator: row.source_locator,
            state: row.state,
            page_count: row.page_count,
            error_message: row.error_message,
            extraction_metadata: serde_json::from_str(&row.extraction_metadata)
                .unwrap_or(serde_json::json!({})),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn format_extract_error(e: &ExtractError) -> String {
    e.to_string()
}

/// Convenience wrapper matching the CLI's `ingest` subcommand: dispatches by
/// source kind, building an [`EngineSelector`] only when web ingestion is
/// requested.
pub async fn run_ingest(
    config: &Config,
    project_id: &str,
    source_kind: &str,
    locator: &str,
    reporter: &dyn IngestionProgressReporter,
) -> Result<Document> {
    let pool = crate::db::connect(config).await?;

    let doc = match source_kind {
        "pdf" => {
            let bytes = std::fs::read(locator)?;
            ingest_pdf(config, &pool, reporter, project_id, locator, None, &bytes).await?
        }
        "text" => {
            let text = std::fs::read_to_string(locator)?;
            ingest_text(config, &pool, reporter, project_id, "text", locator, None, &text).await?
        }
        "web" => {
            let selector = build_engine_selector(config);
            ingest_web_page(config, &pool, reporter, &selector, project_id, locator).await?
        }
        other => anyhow::bail!("unknown ingest source kind: {}", other),
    };

    pool.close().await;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_pages_joins_title_and_text() {
        let pages = vec![ScrapeResult {
            url: "https://x.test".to_string(),
            final_url: "https://x.test".to_string(),
            status: 200,
            html: None,
            text: "body text".to_string(),
            title: Some("Title".to_string()),
            links: vec![],
            engine: "http".to_string(),
            rendered_js: false,
            visual_element_count: 0,
            has_visual_elements: false,
        }];
        let combined = combine_pages(&pages);
        assert!(combined.contains("Title"));
        assert!(combined.contains("body text"));
    }
}
