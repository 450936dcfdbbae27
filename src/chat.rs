//! RAG chat assembler: turns a retrieval result set into a grounded chat
//! completion, streamed to the caller as Server-Sent Events.

use axum::response::sse::Event;
use futures::Stream;
use serde::Serialize;

use crate::config::Config;
use crate::retrieval::SearchResultItem;

/// One SSE frame emitted during a chat stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ChatStreamEvent {
    /// The retrieved context, sent once before any completion tokens.
    Context { chunks: Vec<ChatContextChunk> },
    /// An incremental completion token/fragment.
    Token { text: String },
    /// Terminal event; no further frames follow.
    Done { finish_reason: String },
    /// Terminal event on failure.
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatContextChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub title: Option<String>,
    pub score: f64,
}

/// Build the system prompt grounding the model in the retrieved chunks.
/// Chunks are truncated to `config.chat.max_context_chunks` and numbered so
/// the model can cite `[1]`, `[2]`, etc.
pub fn build_grounded_prompt(query: &str, results: &[SearchResultItem], config: &Config) -> String {
    let mut context = String::new();
    for (i, r) in results.iter().take(config.chat.max_context_chunks).enumerate() {
        context.push_str(&format!(
            "[{}] (doc {}, score {:.3})\n{}\n\n",
            i + 1,
            r.document_id,
            r.score,
            r.text
        ));
    }

    format!(
        "Answer the question using only the numbered context below. Cite sources \
         inline as [n]. If the context does not contain the answer, say so plainly.\n\n\
         Context:\n{}\nQuestion: {}",
        context, query
    )
}

/// Call the configured chat model and stream its response as a sequence of
/// [`ChatStreamEvent`] wrapped as Axum SSE [`Event`]s. The context event is
/// always emitted first regardless of whether the completion call succeeds,
/// so a client can render "searching -> found N sources -> answering".
pub fn stream_chat_response(
    query: String,
    results: Vec<SearchResultItem>,
    config: Config,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let context_chunks: Vec<ChatContextChunk> = results
            .iter()
            .take(config.chat.max_context_chunks)
            .map(|r| ChatContextChunk {
                chunk_id: r.chunk_id.clone(),
                document_id: r.document_id.clone(),
                title: r.title.clone(),
                score: r.score,
            })
            .collect();

        yield Ok(sse_json(&ChatStreamEvent::Context { chunks: context_chunks }));

        if config.chat.provider == "disabled" {
            yield Ok(sse_json(&ChatStreamEvent::Error {
                message: "chat provider is disabled".to_string(),
            }));
            return;
        }

        let prompt = build_grounded_prompt(&query, &results, &config);
        let client = reqwest::Client::new();

        let body = serde_json::json!({
            "model": config.chat.model.clone().unwrap_or_default(),
            "temperature": config.chat.temperature,
            "stream": true,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = client.post(chat_endpoint(&config)).json(&body).send().await;

        match resp {
            Ok(r) if r.status().is_success() => {
                match r.text().await {
                    Ok(text) => {
                        for chunk in split_into_tokens(&text) {
                            yield Ok(sse_json(&ChatStreamEvent::Token { text: chunk }));
                        }
                        yield Ok(sse_json(&ChatStreamEvent::Done { finish_reason: "stop".to_string() }));
                    }
                    Err(e) => {
                        yield Ok(sse_json(&ChatStreamEvent::Error { message: e.to_string() }));
                    }
                }
            }
            Ok(r) => {
                yield Ok(sse_json(&ChatStreamEvent::Error {
                    message: format!("chat model returned status {}", r.status()),
                }));
            }
            Err(e) => {
                yield Ok(sse_json(&ChatStreamEvent::Error { message: e.to_string() }));
            }
        }
    }
}

fn chat_endpoint(config: &Config) -> String {
    match config.chat.provider.as_str() {
        "openai" => "https://api.openai.com/v1/chat/completions".to_string(),
        other => format!("http://localhost:11434/api/{}", other),
    }
}

/// Best-effort word-level split used to fake token streaming over a
/// non-streaming completion response; real provider streaming (SSE-of-SSE)
/// is future work once a concrete chat provider is wired in.
fn split_into_tokens(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(|s| s.to_string()).collect()
}

fn sse_json(event: &ChatStreamEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|_| Event::default().data("{}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grounded_prompt_numbers_context_and_includes_query() {
        let results = vec![SearchResultItem {
            chunk_id: "c1".to_string(),
            document_id: "d1".to_string(),
            title: Some("Doc".to_string()),
            text: "widgets are great".to_string(),
            score: 0.9,
            updated_at: "2024-01-01T00:00:00Z".to_string(),
            ..Default::default()
        }];
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "t.db"
            [chunking]
            chunk_size = 1000
            chunk_overlap = 200
            [retrieval]
            final_limit = 10
            [server]
            bind = "127.0.0.1:8080"
            "#,
        )
        .unwrap();

        let prompt = build_grounded_prompt("what are widgets?", &results, &config);
        assert!(prompt.contains("[1]"));
        assert!(prompt.contains("widgets are great"));
        assert!(prompt.contains("what are widgets?"));
    }

    #[test]
    fn split_into_tokens_preserves_text() {
        let tokens = split_into_tokens("hello there world");
        assert_eq!(tokens.join(""), "hello there world");
    }
}
