//! # docqa CLI
//!
//! ```bash
//! docqa --config ./config/docqa.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa build` | Ingest the document root and write a fresh index |
//! | `docqa search "<query>"` | Show the top-k retrieved chunks |
//! | `docqa ask "<question>"` | Answer one question |
//! | `docqa chat` | Interactive session on stdin |
//! | `docqa status` | Describe the persisted index |
//!
//! `build` exits with 0 on success, 2 when some documents were skipped, and
//! 1 when nothing could be indexed.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use docqa::chat::{ChatOrchestrator, ChatSession};
use docqa::config::{self, Config};
use docqa::embedding::{self, EmbeddingService};
use docqa::generate::{self, AnswerGenerator, RetryPolicy};
use docqa::index::IndexHandle;
use docqa::ingest;
use docqa::models::Message;
use docqa::prompt::{ContextAssembler, PromptBudget};
use docqa::retrieve::Retriever;

/// Answer questions from a private document collection.
#[derive(Parser)]
#[command(name = "docqa", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest the document root and write a fresh index.
    ///
    /// The new index replaces the old one only once it is completely
    /// written.
    Build,

    /// Retrieve the chunks closest to a query without generating an answer.
    Search {
        query: String,

        /// Number of results (defaults to retrieval.top_k).
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Answer a single question.
    Ask { question: String },

    /// Start an interactive chat session.
    ///
    /// `/reload` swaps in the index currently on disk, `/reset` clears the
    /// conversation, `/quit` exits.
    Chat,

    /// Show metadata of the persisted index.
    Status,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Build => run_build(&cfg).await,
        Commands::Search { query, k } => run_search(&cfg, &query, k).await,
        Commands::Ask { question } => run_ask(&cfg, &question).await,
        Commands::Chat => run_chat(&cfg).await,
        Commands::Status => run_status(&cfg).await,
    }
}

/// Secret named by `env_name`, if set and non-empty.
fn secret(env_name: &str) -> Option<String> {
    std::env::var(env_name).ok().filter(|v| !v.is_empty())
}

fn embedding_service(cfg: &Config) -> Result<EmbeddingService> {
    let backend = embedding::create_backend(&cfg.embedding, secret(&cfg.embedding.api_key_env))?;
    Ok(EmbeddingService::new(backend, &cfg.embedding))
}

async fn orchestrator(cfg: &Config) -> Result<ChatOrchestrator> {
    let embedder = Arc::new(embedding_service(cfg)?);
    let index = Arc::new(IndexHandle::open(&cfg.index.path).await);
    let backend = generate::create_backend(&cfg.generation, secret(&cfg.generation.api_key_env))?;

    Ok(ChatOrchestrator::new(
        Retriever::new(embedder, index),
        ContextAssembler::from_config(&cfg.prompt),
        AnswerGenerator::new(backend, RetryPolicy::from_config(&cfg.generation)),
        PromptBudget::from(&cfg.prompt),
        cfg.retrieval.top_k,
    ))
}

async fn run_build(cfg: &Config) -> Result<ExitCode> {
    let embedder = embedding_service(cfg)?;
    let report = ingest::run_build(cfg, &embedder).await?;

    println!("build {}", report.status.as_str());
    println!("  model: {}", report.model_id);
    println!("  documents found: {}", report.documents_found);
    println!("  documents indexed: {}", report.documents_indexed);
    println!("  chunks: {}", report.chunks);
    println!("  entries written: {}", report.entries);
    if report.truncated > 0 {
        println!("  truncated inputs: {}", report.truncated);
    }
    if !report.warnings.is_empty() {
        println!("  warnings: {}", report.warnings.len());
        for warning in &report.warnings {
            println!("    - {}", warning);
        }
    }

    Ok(ExitCode::from(report.status.exit_code() as u8))
}

async fn run_search(cfg: &Config, query: &str, k: Option<usize>) -> Result<ExitCode> {
    let embedder = Arc::new(embedding_service(cfg)?);
    let index = Arc::new(IndexHandle::open(&cfg.index.path).await);
    let retriever = Retriever::new(embedder, index);

    let result = match retriever
        .retrieve(query, k.unwrap_or(cfg.retrieval.top_k))
        .await
    {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    if result.is_empty() {
        println!("No results.");
        return Ok(ExitCode::SUCCESS);
    }
    for (rank, hit) in result.hits.iter().enumerate() {
        println!(
            "{}. [{:.4}] {}#{}",
            rank + 1,
            hit.score,
            hit.entry.source,
            hit.entry.chunk_index
        );
        for line in hit.entry.text.lines() {
            println!("   {}", line);
        }
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_ask(cfg: &Config, question: &str) -> Result<ExitCode> {
    let orchestrator = orchestrator(cfg).await?;
    match orchestrator.respond(&[Message::user(question)]).await {
        Ok(answer) => {
            println!("{}", answer.content);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Error ({:?}): {}", e.kind, e.message);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_chat(cfg: &Config) -> Result<ExitCode> {
    let orchestrator = orchestrator(cfg).await?;
    let mut session = ChatSession::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };
        let input = line.trim();

        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.reset();
                println!("(conversation cleared)");
            }
            "/reload" => match orchestrator.retriever().index().reload(&cfg.index.path).await {
                Ok(()) => println!("(index reloaded)"),
                Err(e) => println!("(reload failed, keeping current index: {})", e),
            },
            text => match orchestrator.turn(&mut session, text).await {
                Ok(reply) => println!("{}\n", reply.content),
                Err(e) => println!("Error: {}\n", e.message),
            },
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_status(cfg: &Config) -> Result<ExitCode> {
    let handle = IndexHandle::open(&cfg.index.path).await;
    let index = match handle.snapshot() {
        Ok(index) => index,
        Err(e) => {
            println!("index: {}", cfg.index.path.display());
            println!("  {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    let built_at = chrono::DateTime::from_timestamp(index.built_at(), 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| index.built_at().to_string());

    println!("index: {}", cfg.index.path.display());
    println!("  model: {}", index.model_id());
    println!("  dims: {}", index.dims());
    println!("  metric: {}", index.metric().as_str());
    println!("  entries: {}", index.len());
    println!("  documents: {}", index.document_count());
    println!("  built: {}", built_at);

    if let Ok(embedder) = embedding_service(cfg) {
        if embedder.model_id() != index.model_id() {
            println!(
                "  warning: configured embedding model is '{}'; rebuild the index",
                embedder.model_id()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}
