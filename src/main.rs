//! # knowledgetree
//!
//! A hybrid retrieval, ingestion, and agentic crawling core for a
//! knowledge-management backend.
//!
//! ## Architecture
//!
//! ```text
//! PDF / Web / Text → Ingestion (classify, extract, chunk, embed) → SQLite (FTS5 + vectors)
//!                                                                        |
//!                                     +----------------------------------+----------------------------------+
//!                                     v                                                                      v
//!                           Hybrid Retrieval / RAG Chat                                           Agentic Crawl Orchestrator
//! ```
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration parsing and validation
//! - [`models`] — Core data types: `Project`, `Document`, `Chunk`, `Category`, `CrawlJob`
//! - [`migrate`] — Database schema migrations
//! - [`db`] — SQLite connection management
//! - [`projects`] — Project CRUD
//! - [`extract`] — Multi-format text extraction
//! - [`classifier`] — Heuristic PDF/document type classification
//! - [`chunk`] — Sentence-aware sliding-window chunker
//! - [`embedding`] — Embedding provider trait and implementations
//! - [`embed_cmd`] — Embedding CLI commands (pending, rebuild)
//! - [`bm25`] — In-memory Okapi BM25 sparse index
//! - [`cross_encoder`] — Cross-encoder reranking provider trait and dispatch
//! - [`retrieval`] — Hybrid dense+sparse retrieval, RRF, reranking, CRAG
//! - [`chat`] — RAG chat assembler with SSE streaming
//! - [`engines`] / [`engine_select`] — Scraping engines and engine selection
//! - [`crawl`] — Breadth-first crawl job orchestration
//! - [`agent`] — Agentic observe-think-act browser loop
//! - [`categories`] — Hierarchical category tree construction
//! - [`ingest`] — Ingestion worker orchestration
//! - [`get`] — Document retrieval by ID
//! - [`server`] — HTTP server (Axum)

mod agent;
mod bm25;
mod categories;
mod chat;
mod chunk;
mod classifier;
mod config;
mod crawl;
mod cross_encoder;
mod db;
mod embed_cmd;
mod embedding;
mod engine_select;
mod engines;
mod extract;
mod get;
mod ingest;
mod migrate;
mod models;
mod progress;
mod projects;
mod retrieval;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "kt",
    about = "knowledgetree — hybrid retrieval, ingestion, and agentic crawling for a knowledge-management backend",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/kt.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Manage projects
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Ingest a PDF, text file, or web page into a project
    Ingest {
        /// Project ID
        project_id: String,

        /// Source kind: pdf, text, or web
        source_kind: String,

        /// File path (pdf/text) or URL (web)
        locator: String,

        /// Progress reporting mode: off, human, json
        #[arg(long)]
        progress: Option<String>,
    },

    /// Create and run a breadth-first crawl job
    Crawl {
        /// Project ID
        project_id: String,

        /// Starting URL
        url: String,

        /// Maximum link depth
        #[arg(long)]
        max_depth: Option<i64>,

        /// Maximum pages to visit
        #[arg(long)]
        max_pages: Option<i64>,

        /// Force a specific scraping engine
        #[arg(long)]
        engine: Option<String>,
    },

    /// Search indexed documents in a project
    Search {
        /// Project ID
        project_id: String,

        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Retrieve a document by ID
    Get {
        /// Document ID (UUID)
        id: String,
    },

    /// Manage embeddings
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Run the agentic crawl orchestrator over a starting URL
    Agent {
        /// Starting URL
        url: String,

        /// Research question for the agent to answer
        query: String,
    },

    /// Start the HTTP server
    Serve,
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a new project
    Create {
        /// Project name
        name: String,
    },
    /// List all projects
    List,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing or have stale embeddings
    Pending {
        /// Maximum number of chunks to embed
        #[arg(long)]
        limit: Option<usize>,

        /// Override batch size from config
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings
    Rebuild {
        /// Override batch size from config
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Project { action } => match action {
            ProjectAction::Create { name } => {
                let pool = db::connect(&cfg).await?;
                let project = projects::create_project(&pool, &name).await?;
                println!("created project {} ({})", project.id, project.name);
                pool.close().await;
            }
            ProjectAction::List => {
                let pool = db::connect(&cfg).await?;
                let all = projects::list_projects(&pool).await?;
                for p in all {
                    println!("{}  {}", p.id, p.name);
                }
                pool.close().await;
            }
        },
        Commands::Ingest {
            project_id,
            source_kind,
            locator,
            progress,
        } => {
            let mode = match progress.as_deref() {
                Some("off") => progress::ProgressMode::Off,
                Some("json") => progress::ProgressMode::Json,
                Some("human") => progress::ProgressMode::Human,
                _ => progress::ProgressMode::default_for_tty(),
            };
            let reporter = mode.reporter();
            let doc = ingest::run_ingest(&cfg, &project_id, &source_kind, &locator, reporter.as_ref()).await?;
            println!("ingested document {} (state={})", doc.id, doc.state);
        }
        Commands::Crawl {
            project_id,
            url,
            max_depth,
            max_pages,
            engine,
        } => {
            let pool = db::connect(&cfg).await?;
            let job = crawl::create_crawl_job(
                &pool,
                &project_id,
                &url,
                max_depth.unwrap_or(cfg.agent.max_depth),
                max_pages.unwrap_or(cfg.agent.max_pages),
                engine.as_deref(),
            )
            .await?;

            let selector = crawl::build_engine_selector(&cfg);
            let reporter = progress::ProgressMode::default_for_tty().reporter();
            let doc = ingest::ingest_crawl_job(&cfg, &pool, reporter.as_ref(), &selector, &job).await?;
            println!("crawl job {} -> document {} (state={})", job.id, doc.id, doc.state);
            pool.close().await;
        }
        Commands::Search { project_id, query, limit } => {
            if query.trim().is_empty() {
                anyhow::bail!("query must not be empty");
            }
            let pool = db::connect(&cfg).await?;
            let coordinator = retrieval::PipelineCoordinator::new(&pool, &cfg);
            let response = coordinator
                .search_with_reranking(&project_id, &query, limit, &retrieval::IdentityReformulation)
                .await?;

            println!(
                "{} results (reranked={}, corrective_requery={})",
                response.results.len(),
                response.reranked,
                response.corrective_requery
            );
            for (i, r) in response.results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} ({})",
                    i + 1,
                    r.score,
                    r.title.as_deref().unwrap_or("(untitled)"),
                    r.document_id
                );
                println!("   {}", r.text);
            }
            pool.close().await;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
            EmbedAction::Rebuild { batch_size } => {
                embed_cmd::run_embed_rebuild(&cfg, batch_size).await?;
            }
        },
        Commands::Agent { url, query } => {
            let selector = crawl::build_engine_selector(&cfg);
            let client = reqwest::Client::new();
            let chat_url = match cfg.chat.provider.as_str() {
                "openai" => "https://api.openai.com/v1/chat/completions".to_string(),
                other => format!("http://localhost:11434/api/{}", other),
            };
            let model = cfg.chat.model.clone().unwrap_or_default();
            let api_key = std::env::var("OPENAI_API_KEY").ok();

            let result = agent::run_agent_loop(&selector, &cfg.agent, &url, &query, |q, current_url, pages| {
                let prompt = format!(
                    "Question: {}\nCurrent page: {}\nPages visited so far: {}\n\
                     Respond with a JSON action: {{\"action\": \"navigate\", \"url\": \"...\"}}, \
                     {{\"action\": \"extract\", \"reason\": \"...\"}}, or {{\"action\": \"stop\", \"answer\": \"...\"}}.",
                    q,
                    current_url,
                    pages.len()
                );
                let fut = agent::think(&client, &chat_url, api_key.as_deref(), &model, &prompt);
                tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
                    .unwrap_or(agent::AgentAction::Stop {
                        answer: "agent reasoning failed; stopping".to_string(),
                    })
            })
            .await;

            println!("agent stopped: {}", result.stopped_reason);
            println!("pages visited: {}", result.pages_visited.len());
            if let Some(answer) = result.final_answer {
                println!("answer: {}", answer);
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
