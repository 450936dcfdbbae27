//! Document retrieval by ID.
//!
//! Fetches a full document and its associated chunks from the database.
//! Used by both the `kt get` CLI command and the `POST /search/get` HTTP endpoint.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::models::format_ts_iso;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub id: String,
    pub project_id: String,
    pub title: Option<String>,
    pub source_kind: String,
    pub source_locator: String,
    pub state: String,
    pub page_count: Option<i64>,
    pub error_message: Option<String>,
    pub extraction_metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
    pub chunks: Vec<ChunkResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub id: String,
    pub index: i64,
    pub text: String,
    pub has_embedding: bool,
}

/// Core get function returning structured data (used by CLI and server).
pub async fn get_document(config: &Config, id: &str) -> Result<DocumentResponse> {
    let pool = db::connect(config).await?;

    let doc_row = sqlx::query(
        r#"
        SELECT id, project_id, title, source_kind, source_locator, state,
               page_count, error_message, extraction_metadata, created_at, updated_at
        FROM documents WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&pool)
    .await?;

    let doc_row = match doc_row {
        Some(row) => row,
        None => {
            pool.close().await;
            bail!("document not found: {}", id);
        }
    };

    let created_at: i64 = doc_row.get("created_at");
    let updated_at: i64 = doc_row.get("updated_at");
    let extraction_metadata_json: String = doc_row.get("extraction_metadata");
    let extraction_metadata: serde_json::Value =
        serde_json::from_str(&extraction_metadata_json).unwrap_or(serde_json::json!({}));

    let chunk_rows = sqlx::query(
        "SELECT id, chunk_index, text, has_embedding FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
    )
    .bind(id)
    .fetch_all(&pool)
    .await?;

    let chunks: Vec<ChunkResponse> = chunk_rows
        .iter()
        .map(|row| {
            let has_embedding_int: i64 = row.get("has_embedding");
            ChunkResponse {
                id: row.get("id"),
                index: row.get("chunk_index"),
                text: row.get("text"),
                has_embedding: has_embedding_int != 0,
            }
        })
        .collect();

    pool.close().await;

    Ok(DocumentResponse {
        id: doc_row.get("id"),
        project_id: doc_row.get("project_id"),
        title: doc_row.get("title"),
        source_kind: doc_row.get("source_kind"),
        source_locator: doc_row.get("source_locator"),
        state: doc_row.get("state"),
        page_count: doc_row.get("page_count"),
        error_message: doc_row.get("error_message"),
        extraction_metadata,
        created_at: format_ts_iso(created_at),
        updated_at: format_ts_iso(updated_at),
        chunks,
    })
}

/// CLI entry point — calls get_document and prints to stdout.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let doc = match get_document(config, id).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("--- Document ---");
    println!("id:                {}", doc.id);
    println!(
        "title:             {}",
        doc.title.as_deref().unwrap_or("(untitled)")
    );
    println!("project_id:        {}", doc.project_id);
    println!("source_kind:       {}", doc.source_kind);
    println!("source_locator:    {}", doc.source_locator);
    println!("state:             {}", doc.state);
    if let Some(pages) = doc.page_count {
        println!("page_count:        {}", pages);
    }
    if let Some(ref err) = doc.error_message {
        println!("error_message:     {}", err);
    }
    println!("created_at:        {}", doc.created_at);
    println!("updated_at:        {}", doc.updated_at);
    println!("extraction_metadata: {}", doc.extraction_metadata);
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!("[chunk {} embedded={}]", chunk.index, chunk.has_embedding);
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}
