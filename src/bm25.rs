//! In-memory BM25 sparse index.
//!
//! Maintains per-project term statistics (document frequency, average
//! document length) and scores chunks with the Okapi BM25 formula. Built
//! lazily from SQLite on first use and kept in memory as a "shard"; the
//! authoritative text lives in `chunks`/`chunks_fts`, so a shard can always
//! be rebuilt by re-scanning the table.

use std::collections::HashMap;

use sqlx::SqlitePool;

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// Tokenize by lowercasing and splitting on non-alphanumeric runs. No
/// stemming; matches the simple whitespace/punctuation tokenizer the rest
/// of the pipeline assumes when computing term overlap for query expansion.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone)]
struct PostingEntry {
    chunk_id: String,
    term_freq: u32,
}

/// An in-memory BM25 shard for one project: postings lists plus the
/// document-length statistics BM25 needs.
pub struct Bm25Shard {
    pub project_id: String,
    postings: HashMap<String, Vec<PostingEntry>>,
    doc_lengths: HashMap<String, u32>,
    avg_doc_len: f64,
    doc_count: usize,
}

impl Bm25Shard {
    /// Build a shard by scanning every chunk belonging to `project_id`.
    pub async fn build(pool: &SqlitePool, project_id: &str) -> sqlx::Result<Self> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT c.id, c.text
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.project_id = ?
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await?;

        let mut postings: HashMap<String, Vec<PostingEntry>> = HashMap::new();
        let mut doc_lengths = HashMap::new();
        let mut total_len: u64 = 0;

        for (chunk_id, text) in &rows {
            let tokens = tokenize(text);
            doc_lengths.insert(chunk_id.clone(), tokens.len() as u32);
            total_len += tokens.len() as u64;

            let mut tf: HashMap<String, u32> = HashMap::new();
            for t in tokens {
                *tf.entry(t).or_insert(0) += 1;
            }
            for (term, freq) in tf {
                postings.entry(term).or_default().push(PostingEntry {
                    chunk_id: chunk_id.clone(),
                    term_freq: freq,
                });
            }
        }

        let doc_count = rows.len();
        let avg_doc_len = if doc_count > 0 {
            total_len as f64 / doc_count as f64
        } else {
            0.0
        };

        Ok(Self {
            project_id: project_id.to_string(),
            postings,
            doc_lengths,
            avg_doc_len,
            doc_count,
        })
    }

    /// Score every chunk containing at least one query term, returning
    /// `(chunk_id, score)` pairs sorted descending by score.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f64)> {
        if self.doc_count == 0 {
            return Vec::new();
        }
        let query_terms = tokenize(query);
        let mut scores: HashMap<String, f64> = HashMap::new();

        for term in &query_terms {
            let Some(entries) = self.postings.get(term) else {
                continue;
            };
            let df = entries.len() as f64;
            // BM25 IDF with the +1 smoothing term to keep it non-negative
            // for terms appearing in the majority of documents.
            let idf = ((self.doc_count as f64 - df + 0.5) / (df + 0.5) + 1.0).ln();

            for entry in entries {
                let doc_len = *self.doc_lengths.get(&entry.chunk_id).unwrap_or(&0) as f64;
                let tf = entry.term_freq as f64;
                let denom = tf + K1 * (1.0 - B + B * doc_len / self.avg_doc_len.max(1.0));
                let score = idf * (tf * (K1 + 1.0)) / denom.max(f64::EPSILON);
                *scores.entry(entry.chunk_id.clone()).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);
        ranked
    }

    pub fn doc_count(&self) -> usize {
        self.doc_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_splits() {
        let toks = tokenize("Hello, World! BM25-rules.");
        assert_eq!(toks, vec!["hello", "world", "bm25", "rules"]);
    }

    #[test]
    fn tokenize_empty() {
        assert!(tokenize("   ---  ").is_empty());
    }
}
