//! # Helpdesk Harness CLI (`hdx`)
//!
//! Builds the document index, answers retrieval queries, runs tickets
//! through triage and the confidence gate, and serves the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! hdx --config ./config/hdx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hdx init` | Create the results database and run schema migrations |
//! | `hdx index build` | Chunk and embed the documents root, persist the index |
//! | `hdx index status` | Show what the persisted index holds and whether it is usable |
//! | `hdx retrieve "<query>"` | Retrieve ranked evidence for a query |
//! | `hdx ticket "<question>"` | Run a ticket through the full pipeline |
//! | `hdx escalations` | List escalations waiting for a human |
//! | `hdx resolve <ticket_id>` | Close a ticket's escalation |
//! | `hdx stats` | Summarize recorded outcomes |
//! | `hdx serve` | Start the HTTP server |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use helpdesk_harness::analysis::QueryAnalyzer;
use helpdesk_harness::config::{self, Config, LoggingConfig};
use helpdesk_harness::embedding::create_embedder;
use helpdesk_harness::index_store::{index_status, load_index, save_index};
use helpdesk_harness::pipeline::{build_retriever, new_ticket_id, TicketOutcome, TicketPipeline};
use helpdesk_harness::{db, ingest, migrate, results, server};
use helpdesk_harness_core::embedding::Embedder;
use helpdesk_harness_core::error::IndexError;
use helpdesk_harness_core::index::SharedIndex;
use helpdesk_harness_core::models::{QueryData, RetrievalResult};

/// Helpdesk Harness: document retrieval and confidence gating for support
/// tickets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/hdx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "hdx",
    about = "Helpdesk Harness: retrieval and confidence gating for support tickets",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hdx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the results database schema. Safe to run repeatedly.
    Init,

    /// Build or inspect the document index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Retrieve ranked evidence for a query.
    Retrieve {
        /// Reformulated question to search for.
        query: String,

        /// Category used for query augmentation.
        #[arg(long)]
        category: Option<String>,

        /// Keyword (repeatable).
        #[arg(long = "keyword")]
        keywords: Vec<String>,

        /// Restrict results to this source document (repeatable).
        #[arg(long = "doc")]
        documents: Vec<String>,

        /// Derive category, keywords and documents from the query text.
        #[arg(long)]
        analyze: bool,

        /// Number of chunks to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Search with the reformulated query only.
        #[arg(long)]
        no_augment: bool,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run a support ticket through triage, retrieval and the confidence gate.
    Ticket {
        /// The customer's question.
        question: String,

        /// Ticket identifier (generated when omitted).
        #[arg(long)]
        id: Option<String>,

        /// Do not write the outcome to the results database.
        #[arg(long)]
        no_record: bool,

        /// Print the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List escalations waiting for a human, most urgent first.
    Escalations {
        /// Include resolved escalations.
        #[arg(long)]
        all: bool,

        #[arg(long)]
        json: bool,
    },

    /// Mark a ticket's open escalation resolved.
    Resolve { ticket_id: String },

    /// Show a summary of recorded tickets and escalations.
    Stats,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Chunk and embed every document under the documents root and
    /// replace the persisted index.
    Build {
        /// Documents root (overrides `[documents].root`).
        #[arg(long)]
        docs: Option<PathBuf>,
    },
    /// Report what the persisted index holds and whether it matches the
    /// configured model and chunking.
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_env("HDX_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let result = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }
}

/// Load the persisted index, refusing artifacts the configured embedder
/// cannot query.
fn open_index(cfg: &Config, embedder: &dyn Embedder) -> Result<SharedIndex> {
    let index = load_index(&cfg.index.dir).map_err(|e| match e {
        IndexError::Corrupt { .. } => anyhow::anyhow!(
            "{}\nRun `hdx index build` to rebuild the index at {}.",
            e,
            cfg.index.dir.display()
        ),
        other => other.into(),
    })?;
    if index.model() != embedder.model_name() || index.dims() != embedder.dims() {
        bail!(
            "Index was built with '{}' ({} dims) but the configured embedder is '{}' ({} dims).\nRun `hdx index build` to rebuild it.",
            index.model(),
            index.dims(),
            embedder.model_name(),
            embedder.dims()
        );
    }
    Ok(SharedIndex::with_index(index))
}

fn print_retrieval(result: &RetrievalResult) {
    if result.is_empty() {
        println!("No results.");
        return;
    }
    for (i, chunk) in result.chunks.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}#{}",
            i + 1,
            chunk.final_score(),
            chunk.source,
            chunk.chunk_index
        );
        let preview: String = chunk.text.chars().take(160).collect();
        println!("    {}", preview.replace('\n', " "));
    }
    println!();
    println!(
        "chunks: {}  sources: {}  mean score: {:.3}",
        result.chunk_count,
        result.source_count(),
        result.mean_score
    );
}

fn print_outcome(outcome: &TicketOutcome) {
    println!("Ticket:   {}", outcome.ticket_id);
    println!("Trace:    {}", outcome.trace_id);
    println!("Status:   {}", outcome.status.as_str());
    if let Some(query) = &outcome.query {
        println!("Category: {}", query.category);
        println!("Keywords: {}", query.keywords.join(", "));
    }
    if let Some(retrieval) = &outcome.retrieval {
        let sources: Vec<&str> = retrieval.sources.iter().map(String::as_str).collect();
        println!(
            "Evidence: {} chunks from {} ({:.3} mean)",
            retrieval.chunk_count,
            if sources.is_empty() {
                "-".to_string()
            } else {
                sources.join(", ")
            },
            retrieval.mean_score
        );
    }
    if let Some(decision) = &outcome.decision {
        println!(
            "Decision: {} ({:.2}) {}",
            decision.verdict, decision.final_confidence, decision.reason
        );
    }
    if let Some(escalation) = &outcome.escalation {
        println!(
            "Escalate: {} priority: {}",
            escalation.priority, escalation.reason
        );
    } else if !outcome.triage.coherent {
        println!("Rejected: {}", outcome.triage.reason());
    }
    println!("Time:     {:.1} ms", outcome.timings.total_ms);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.index.dir).with_context(|| {
                format!("Failed to create index dir {}", cfg.index.dir.display())
            })?;
            println!("Database initialized successfully.");
        }
        Commands::Index { action } => match action {
            IndexAction::Build { docs } => {
                let embedder = create_embedder(&cfg.embedding)?;
                let (index, report) =
                    ingest::build_index(&cfg, embedder.as_ref(), docs.as_deref()).await?;
                let metadata = save_index(&cfg.index.dir, &index)?;
                println!(
                    "Indexed {} documents into {} chunks ({} dims, model {}).",
                    report.documents, report.chunks, report.dims, report.model
                );
                println!("Saved to {} at {}", cfg.index.dir.display(), metadata.built_at);
            }
            IndexAction::Status { json } => {
                let embedder = create_embedder(&cfg.embedding)?;
                let status = index_status(
                    &cfg.index.dir,
                    cfg.chunking.params(),
                    embedder.model_name(),
                );
                if json {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                } else {
                    println!("Index:      {}", cfg.index.dir.display());
                    println!("Present:    {}", status.present);
                    println!("Compatible: {}", status.compatible);
                    println!("Chunks:     {}", status.chunk_count);
                    println!("Dims:       {}", status.dims);
                    println!("Model:      {}", status.model.as_deref().unwrap_or("-"));
                    println!("Built at:   {}", status.built_at.as_deref().unwrap_or("-"));
                    if !status.sources.is_empty() {
                        println!();
                        println!("  {:<32} {:>8}", "SOURCE", "CHUNKS");
                        println!("  {}", "-".repeat(42));
                        for (source, n) in &status.sources {
                            println!("  {:<32} {:>8}", source, n);
                        }
                    }
                    for problem in &status.problems {
                        println!("Problem:    {}", problem);
                    }
                }
            }
        },
        Commands::Retrieve {
            query,
            category,
            keywords,
            documents,
            analyze,
            top_k,
            no_augment,
            json,
        } => {
            let embedder = create_embedder(&cfg.embedding)?;
            let index = open_index(&cfg, embedder.as_ref())?;
            let retriever = build_retriever(&cfg, index, embedder);

            let mut data = if analyze {
                QueryAnalyzer::with_overrides(&cfg.analysis.category_documents).analyze(&query)
            } else {
                QueryData::new(query)
            };
            if let Some(category) = category {
                data.category = category;
            }
            if !keywords.is_empty() {
                data.keywords = keywords;
            }
            if !documents.is_empty() {
                data.documents = documents;
            }

            let result = retriever
                .retrieve(
                    &data,
                    top_k.unwrap_or(cfg.retrieval.top_k),
                    cfg.retrieval.use_augmentation && !no_augment,
                )
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_retrieval(&result);
            }
        }
        Commands::Ticket {
            question,
            id,
            no_record,
            json,
        } => {
            let embedder = create_embedder(&cfg.embedding)?;
            let index = open_index(&cfg, embedder.as_ref())?;
            let pipeline = TicketPipeline::from_config(&cfg, index, Arc::clone(&embedder))?;

            let ticket_id = id.unwrap_or_else(new_ticket_id);
            let outcome = pipeline.process(&ticket_id, &question).await?;

            if !no_record {
                let pool = db::connect(&cfg).await?;
                migrate::apply_schema(&pool).await?;
                results::record_outcome(&pool, &outcome).await?;
                pool.close().await;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
        }
        Commands::Escalations { all, json } => {
            let pool = db::connect(&cfg).await?;
            migrate::apply_schema(&pool).await?;
            let escalations = results::list_escalations(&pool, !all).await?;
            pool.close().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&escalations)?);
            } else if escalations.is_empty() {
                println!("No escalations.");
            } else {
                println!(
                    "  {:<16} {:<9} {:<9} {:<17}   {}",
                    "TICKET", "PRIORITY", "STATE", "ESCALATED", "REASON"
                );
                println!("  {}", "-".repeat(90));
                for e in &escalations {
                    let when = chrono::DateTime::parse_from_rfc3339(&e.escalated_at)
                        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|_| e.escalated_at.clone());
                    println!(
                        "  {:<16} {:<9} {:<9} {:<17}   {}",
                        e.ticket_id,
                        e.priority,
                        if e.resolved { "resolved" } else { "open" },
                        when,
                        e.reason
                    );
                }
            }
        }
        Commands::Resolve { ticket_id } => {
            let pool = db::connect(&cfg).await?;
            migrate::apply_schema(&pool).await?;
            let closed = results::resolve_escalation(&pool, &ticket_id).await?;
            pool.close().await;
            if closed == 0 {
                bail!("No open escalation for ticket {}", ticket_id);
            }
            println!("Resolved escalation for {}.", ticket_id);
        }
        Commands::Stats => {
            results::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
