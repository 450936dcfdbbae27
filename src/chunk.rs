//! Sentence-aware sliding-window chunker with neighbor context.
//!
//! Splits document body text into overlapping [`Chunk`]s along sentence
//! boundaries where possible, falling back to a hard character split for
//! runs of text with no sentence punctuation (tables, code, CJK). Each
//! chunk carries `before`/`after` snippets taken from its immediate physical
//! neighbors at creation time, fixed regardless of later chunk edits.
//!
//! Each chunk receives a UUID v4 id, plus a SHA-256 hash of its text for
//! staleness detection against re-ingestion.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Characters of trailing/leading context captured into `before`/`after`.
const NEIGHBOR_CONTEXT_CHARS: usize = 200;

/// A sentence boundary is any of `. ! ?` followed by whitespace or end of string.
fn find_sentence_boundaries(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut bounds = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            let next_is_boundary = match bytes.get(i + 1) {
                None => true,
                Some(&n) => n == b' ' || n == b'\n' || n == b'\t',
            };
            if next_is_boundary {
                bounds.push(i + 1);
            }
        }
    }
    bounds
}

/// Split `text` into chunks of up to `chunk_size` characters, overlapping by
/// `overlap` characters, preferring to break on sentence boundaries within
/// the window. Returns chunks with contiguous indices starting at 0, each
/// annotated with `before`/`after` neighbor context.
pub fn chunk_text(document_id: &str, text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return vec![make_chunk(document_id, 0, "", None, None, 0, 0)];
    }

    if trimmed.len() <= chunk_size {
        return vec![make_chunk(
            document_id,
            0,
            trimmed,
            None,
            None,
            0,
            trimmed.len(),
        )];
    }

    let boundaries = find_sentence_boundaries(trimmed);
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut start = 0usize;

    while start < trimmed.len() {
        let ideal_end = (start + chunk_size).min(trimmed.len());
        let end = if ideal_end == trimmed.len() {
            ideal_end
        } else {
            // Prefer the last sentence boundary inside (start, ideal_end].
            let candidate = boundaries
                .iter()
                .rev()
                .find(|&&b| b > start && b <= ideal_end)
                .copied();
            match candidate {
                Some(b) if b > start + chunk_size / 4 => b,
                _ => ideal_end,
            }
        };

        spans.push((start, end));

        if end >= trimmed.len() {
            break;
        }
        let next_start = end.saturating_sub(overlap);
        start = if next_start > start { next_start } else { end };
    }

    let mut chunks = Vec::with_capacity(spans.len());
    for (i, &(s, e)) in spans.iter().enumerate() {
        let piece = trimmed[s..e].trim();
        let before = if s == 0 {
            None
        } else {
            let ctx_start = s.saturating_sub(NEIGHBOR_CONTEXT_CHARS);
            Some(floor_char_boundary(trimmed, ctx_start, s).trim().to_string())
        };
        let after = if e >= trimmed.len() {
            None
        } else {
            let ctx_end = (e + NEIGHBOR_CONTEXT_CHARS).min(trimmed.len());
            Some(ceil_char_boundary(trimmed, e, ctx_end).trim().to_string())
        };
        chunks.push(make_chunk(
            document_id,
            i as i64,
            piece,
            before,
            after,
            s,
            e,
        ));
    }

    if chunks.is_empty() {
        chunks.push(make_chunk(document_id, 0, trimmed, None, None, 0, trimmed.len()));
    }

    chunks
}

/// Slice `text[start..end]`, nudging both ends to the nearest char boundary
/// (text may contain multi-byte UTF-8 sequences at arbitrary byte offsets).
fn floor_char_boundary<'a>(text: &'a str, mut start: usize, end: usize) -> &'a str {
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    &text[start..end]
}

fn ceil_char_boundary<'a>(text: &'a str, start: usize, mut end: usize) -> &'a str {
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    &text[start..end]
}

fn make_chunk(
    document_id: &str,
    index: i64,
    text: &str,
    before: Option<String>,
    after: Option<String>,
    start_char: usize,
    end_char: usize,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        before,
        after,
        metadata: serde_json::json!({
            "start_char": start_char,
            "end_char": end_char,
            "length": text.len(),
        }),
        hash,
        has_embedding: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 1000, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert!(chunks[0].before.is_none());
        assert!(chunks[0].after.is_none());
    }

    #[test]
    fn empty_text() {
        let chunks = chunk_text("doc1", "", 1000, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn indices_contiguous_and_neighbors_present() {
        let sentence = "This is a moderately long sentence about widgets. ";
        let text = sentence.repeat(80);
        let chunks = chunk_text("doc1", &text, 400, 80);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
        assert!(chunks[0].after.is_some());
        assert!(chunks.last().unwrap().before.is_some());
        assert!(chunks[1].before.is_some());
    }

    #[test]
    fn deterministic() {
        let text = "Alpha one. Beta two. Gamma three. Delta four. ".repeat(30);
        let c1 = chunk_text("doc1", &text, 300, 60);
        let c2 = chunk_text("doc1", &text, 300, 60);
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.hash, b.hash);
            assert_eq!(a.chunk_index, b.chunk_index);
        }
    }

    #[test]
    fn handles_multibyte_utf8_without_panicking() {
        let text = "café résumé naïve ".repeat(100);
        let chunks = chunk_text("doc1", &text, 200, 40);
        assert!(!chunks.is_empty());
    }
}
