//! Embedding CLI commands and the inline embedding step used by the
//! ingestion worker.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::models::Chunk;

/// Find and embed chunks that are missing or have stale embeddings.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let model_name = provider.model_name().to_string();
    let pool = db::connect(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    let pending = find_pending_chunks(&pool, &model_name, limit).await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all chunks up to date");
        return Ok(());
    }

    let (embedded, failed) =
        embed_and_store(&config, &pool, provider.as_ref(), &model_name, &pending, batch_size).await;

    println!("embed pending");
    println!("  total pending: {}", pending.len());
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

/// Delete all embeddings and regenerate for all chunks.
pub async fn run_embed_rebuild(config: &Config, batch_size_override: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let model_name = provider.model_name().to_string();
    let pool = db::connect(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    sqlx::query("DELETE FROM chunk_vectors").execute(&pool).await?;
    sqlx::query("UPDATE chunks SET has_embedding = 0").execute(&pool).await?;

    println!("embed rebuild — cleared existing embeddings");

    let all_chunks = find_pending_chunks(&pool, &model_name, None).await?;

    if all_chunks.is_empty() {
        println!("  no chunks to embed");
        pool.close().await;
        return Ok(());
    }

    let (embedded, failed) =
        embed_and_store(&config, &pool, provider.as_ref(), &model_name, &all_chunks, batch_size).await;

    println!("embed rebuild");
    println!("  total chunks: {}", all_chunks.len());
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

/// Embed chunks inline during ingestion. Non-fatal on per-batch failure —
/// the caller decides whether a partially-embedded document is acceptable.
pub async fn embed_chunks_inline(config: &Config, pool: &SqlitePool, chunks: &[Chunk]) -> (u64, u64) {
    if !config.embedding.is_enabled() {
        return (0, 0);
    }

    let provider = match embedding::create_provider(&config.embedding) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Warning: could not create embedding provider: {}", e);
            return (0, chunks.len() as u64);
        }
    };
    let model_name = provider.model_name().to_string();
    let batch_size = config.embedding.batch_size;

    let mut embedded = 0u64;
    let mut failed = 0u64;

    for batch in chunks.chunks(batch_size) {
        match embedding::embed_chunks_contextual(provider.as_ref(), &config.embedding, batch).await {
            Ok(vectors) => {
                for (chunk, vec) in batch.iter().zip(vectors.iter()) {
                    let blob = embedding::vec_to_blob(vec);
                    if let Err(e) = store_embedding(
                        pool,
                        &chunk.id,
                        &chunk.document_id,
                        &model_name,
                        provider.dims(),
                        &blob,
                    )
                    .await
                    {
                        eprintln!("Warning: failed to store embedding for {}: {}", chunk.id, e);
                        failed += 1;
                    } else {
                        embedded += 1;
                    }
                }
            }
            Err(e) => {
                eprintln!("Warning: embedding batch failed: {}", e);
                failed += batch.len() as u64;
            }
        }
    }

    (embedded, failed)
}

struct PendingChunk {
    chunk: Chunk,
}

async fn find_pending_chunks(
    pool: &SqlitePool,
    _model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingChunk>> {
    let limit_val = limit.unwrap_or(usize::MAX) as i64;

    let rows = sqlx::query(
        r#"
        SELECT id, document_id, chunk_index, text, before, after, metadata, hash, has_embedding
        FROM chunks
        WHERE has_embedding = 0
        ORDER BY document_id, chunk_index
        LIMIT ?
        "#,
    )
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    let results = rows
        .iter()
        .map(|row| {
            let metadata_json: String = row.get("metadata");
            let has_embedding_int: i64 = row.get("has_embedding");
            PendingChunk {
                chunk: Chunk {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    before: row.get("before"),
                    after: row.get("after"),
                    metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
                    hash: row.get("hash"),
                    has_embedding: has_embedding_int != 0,
                },
            }
        })
        .collect();

    Ok(results)
}

async fn embed_and_store(
    config: &Config,
    pool: &SqlitePool,
    provider: &dyn embedding::EmbeddingProvider,
    model_name: &str,
    pending: &[PendingChunk],
    batch_size: usize,
) -> (u64, u64) {
    let mut embedded = 0u64;
    let mut failed = 0u64;

    for batch in pending.chunks(batch_size) {
        let chunks: Vec<Chunk> = batch.iter().map(|p| p.chunk.clone()).collect();
        match embedding::embed_chunks_contextual(provider, &config.embedding, &chunks).await {
            Ok(vectors) => {
                for (chunk, vec) in chunks.iter().zip(vectors.iter()) {
                    let blob = embedding::vec_to_blob(vec);
                    if let Err(e) =
                        store_embedding(pool, &chunk.id, &chunk.document_id, model_name, provider.dims(), &blob)
                            .await
                    {
                        eprintln!("Warning: failed to store embedding for {}: {}", chunk.id, e);
                        failed += 1;
                    } else {
                        embedded += 1;
                    }
                }
            }
            Err(e) => {
                eprintln!("Warning: embedding batch failed: {}", e);
                failed += batch.len() as u64;
            }
        }
    }

    (embedded, failed)
}

async fn store_embedding(
    pool: &SqlitePool,
    chunk_id: &str,
    document_id: &str,
    model: &str,
    dims: usize,
    blob: &[u8],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, embedding, model, dims, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            embedding = excluded.embedding,
            model = excluded.model,
            dims = excluded.dims,
            created_at = excluded.created_at
        "#,
    )
    .bind(chunk_id)
    .bind(document_id)
    .bind(blob)
    .bind(model)
    .bind(dims as i64)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE chunks SET has_embedding = 1 WHERE id = ?")
        .bind(chunk_id)
        .execute(pool)
        .await?;

    Ok(())
}
