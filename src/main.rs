//! # Corpus QA CLI (`cqa`)
//!
//! The `cqa` binary is the primary interface for Corpus QA. It provides
//! commands for database initialization, document ingestion, question
//! answering, retrieval debugging, example-index management, and the
//! HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! cqa --config ./config/cqa.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cqa init` | Create knowledge base databases and run migrations |
//! | `cqa ingest <kb\|all>` | Incrementally ingest changed documents |
//! | `cqa ingest <kb\|all> --rebuild` | Rebuild a knowledge base from scratch |
//! | `cqa ask "<question>"` | Answer one question (optionally in a session) |
//! | `cqa search "<query>"` | Ranked retrieval without routing |
//! | `cqa examples rebuild <kb\|all>` | Force a few-shot index rebuild |
//! | `cqa stats` | Per-knowledge-base document/chunk/example counts |
//! | `cqa serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use corpus_qa::config::{self, UpdatePolicy};
use corpus_qa::ingest;
use corpus_qa::rank;
use corpus_qa::router::{self, QaEngine};
use corpus_qa::server;
use corpus_qa::store::KnowledgeStore;

/// Corpus QA — question answering over private document collections.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cqa.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cqa",
    about = "Corpus QA — question answering over private document collections",
    version,
    long_about = "Corpus QA combines lexical/semantic retrieval over per-knowledge-base \
    SQLite stores with an optional few-shot generation fallback, arbitrating between them \
    per conversational turn."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize every configured knowledge base database.
    ///
    /// Creates the SQLite files and all required tables. Idempotent —
    /// running it multiple times is safe.
    Init,

    /// Ingest documents into one knowledge base, or all of them.
    ///
    /// Without flags this is an incremental update: unchanged files
    /// (matched by content hash) are skipped entirely; changed files are
    /// re-segmented and re-embedded under the configured update policy.
    Ingest {
        /// Knowledge base name, or `all`.
        kb: String,

        /// Rebuild from scratch instead of updating incrementally. The
        /// new database becomes visible only via an atomic swap.
        #[arg(long)]
        rebuild: bool,

        /// Override the update policy: `append` keeps superseded chunks
        /// retrievable, `replace` deletes them.
        #[arg(long)]
        policy: Option<String>,

        /// Show file and chunk counts without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Ask a question and print the routed answer.
    Ask {
        /// The question text.
        question: String,

        /// Session identifier for multi-turn conversations. A fresh one
        /// is generated (and printed) when omitted.
        #[arg(long)]
        session: Option<String>,
    },

    /// Ranked retrieval without answer routing. Debugging aid.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of hits to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Manage few-shot example indexes.
    Examples {
        #[command(subcommand)]
        action: ExamplesAction,
    },

    /// Per-knowledge-base document, chunk, and example counts.
    Stats,

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum ExamplesAction {
    /// Re-embed and replace the example index, regardless of cache state.
    Rebuild {
        /// Knowledge base name, or `all`.
        #[arg(default_value = "all")]
        kb: String,
    },
}

fn parse_policy(raw: &str) -> anyhow::Result<UpdatePolicy> {
    match raw {
        "append" => Ok(UpdatePolicy::Append),
        "replace" => Ok(UpdatePolicy::Replace),
        other => anyhow::bail!("Unknown update policy: '{}'. Use append or replace.", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            for kb in &cfg.knowledge_bases {
                let store =
                    KnowledgeStore::open(&kb.name, &cfg.storage.data_dir, cfg.chunking.clone())
                        .await?;
                store.close().await;
            }
            println!("Knowledge bases initialized successfully.");
        }
        Commands::Ingest {
            kb,
            rebuild,
            policy,
            dry_run,
        } => {
            let policy_override = policy.as_deref().map(parse_policy).transpose()?;
            ingest::run_ingest(&cfg, &kb, rebuild, policy_override, dry_run).await?;
        }
        Commands::Ask { question, session } => {
            router::run_ask(&cfg, &question, session).await?;
        }
        Commands::Search { query, limit } => {
            rank::run_search(&cfg, &query, limit).await?;
        }
        Commands::Examples { action } => match action {
            ExamplesAction::Rebuild { kb } => {
                ingest::run_examples_rebuild(&cfg, &kb).await?;
            }
        },
        Commands::Stats => {
            ingest::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            let engine = QaEngine::open(cfg).await?;
            server::run_server(engine).await?;
        }
    }

    Ok(())
}
