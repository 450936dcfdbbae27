//! # knowledgetree-core
//!
//! A hybrid retrieval, ingestion, and agentic crawling core for a
//! knowledge-management backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────────┐   ┌──────────┐
//! │ PDF / Web │──▶│  Ingestion     │──▶│  SQLite   │
//! │ / Text    │   │  (classify,    │   │ FTS5+Vec  │
//! │           │   │  extract,      │   │           │
//! │           │   │  chunk, embed) │   │           │
//! └───────────┘   └───────────────┘   └────┬─────┘
//!                                           │
//!                      ┌────────────────────┼────────────────────┐
//!                      ▼                    ▼                    ▼
//!                ┌──────────┐        ┌─────────────┐      ┌────────────┐
//!                │  Hybrid  │        │  RAG Chat    │      │  Agentic   │
//!                │ Retrieval│        │  (SSE)       │      │  Crawl     │
//!                └──────────┘        └─────────────┘      └────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A source (PDF bytes, a web page, a crawl job, or raw text) is handed
//!    to the **ingestion worker** ([`ingest`]), which classifies, extracts,
//!    chunks, and embeds it into a [`models::Document`] with
//!    [`models::Chunk`]s.
//! 2. Chunks are indexed in **FTS5** for the sparse side of retrieval
//!    ([`bm25`]) and embedded into `chunk_vectors` for the dense side.
//! 3. The **retrieval pipeline** ([`retrieval`]) fuses dense and sparse
//!    rankings with Reciprocal Rank Fusion, optionally reranks, and runs a
//!    corrective-retrieval (CRAG) loop.
//! 4. Retrieved chunks feed the **chat assembler** ([`chat`]) for grounded,
//!    streamed answers, or the **agentic crawler** ([`agent`]) for
//!    multi-step web research.
//! 5. Everything is exposed via the **CLI** (`kt`) and an Axum **HTTP
//!    server** ([`server`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: `Project`, `Document`, `Chunk`, `Category`, `CrawlJob` |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`projects`] | Project CRUD |
//! | [`extract`] | Multi-format text extraction (PDF waterfall, DOCX/PPTX/XLSX) |
//! | [`classifier`] | Heuristic PDF/document type classification |
//! | [`chunk`] | Sentence-aware sliding-window chunker with neighbor context |
//! | [`embedding`] | Embedding provider trait, OpenAI/Ollama/local implementations |
//! | [`embed_cmd`] | Embedding CLI commands: `pending` and `rebuild` |
//! | [`bm25`] | In-memory Okapi BM25 sparse index |
//! | [`cross_encoder`] | Cross-encoder reranking provider trait and dispatch |
//! | [`retrieval`] | Hybrid dense+sparse retrieval, RRF, reranking, CRAG |
//! | [`chat`] | RAG chat assembler with SSE streaming |
//! | [`engines`] | Scraping engines behind a uniform contract (HTTP/headless/managed) |
//! | [`engine_select`] | Cost-escalating engine selection with per-domain memory |
//! | [`crawl`] | Breadth-first crawl job orchestration |
//! | [`agent`] | Agentic observe-think-act browser loop |
//! | [`categories`] | Hierarchical category tree construction |
//! | [`ingest`] | Ingestion worker tying extraction/chunking/embedding together |
//! | [`get`] | Document retrieval by ID |
//! | [`server`] | HTTP server (Axum) with CORS and SSE |
//! | [`progress`] | Ingestion progress reporting (stderr, JSON, SSE channel) |
//!
//! ## Configuration
//!
//! The system is configured via a TOML file (default: `config/kt.toml`). See
//! [`config`] for all available options and [`config::load_config`] for
//! validation rules.

pub mod agent;
pub mod bm25;
pub mod categories;
pub mod chat;
pub mod chunk;
pub mod classifier;
pub mod config;
pub mod crawl;
pub mod cross_encoder;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod engine_select;
pub mod engines;
pub mod extract;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod projects;
pub mod retrieval;
pub mod server;
