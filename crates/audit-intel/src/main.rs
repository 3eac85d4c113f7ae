//! # Audit Intel CLI (`audit-intel`)
//!
//! Command-line front end over the ingestion and retrieval core.
//!
//! ## Usage
//!
//! ```bash
//! audit-intel --config ./config/audit-intel.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `audit-intel init` | Create the catalog and index databases |
//! | `audit-intel ingest <paths>...` | Upload files (directories are walked) and wait for ingestion |
//! | `audit-intel reingest <id>` | Retry a failed document |
//! | `audit-intel delete <id>` | Delete a document and its index records |
//! | `audit-intel list` | List documents and their states |
//! | `audit-intel get <id>` | Show one document |
//! | `audit-intel search "<query>"` | Ranked chunk retrieval |
//! | `audit-intel stats` | Document, chunk, cache and job counters |
//! | `audit-intel health` | Index reachability and failure backlog |
//!
//! Log output goes to stderr; command output goes to stdout.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use audit_intel::config::{self, Config};
use audit_intel::engine::Engine;
use audit_intel::lifecycle::UploadRequest;
use audit_intel::retrieve::Query;
use audit_intel::scan::collect_files;
use audit_intel_core::index::SearchFilters;
use audit_intel_core::models::{Category, DocumentState};

/// Audit Intel: ingest audit documents and retrieve relevant passages.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without a `[db]` path and a persistent `[index]` backend nothing
/// survives the process, so `ingest` followed by `search` needs both.
#[derive(Parser)]
#[command(name = "audit-intel", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/audit-intel.toml")]
    config: PathBuf,

    /// Log at debug level regardless of `[log].level`.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the catalog and index databases. Safe to run repeatedly.
    Init,

    /// Upload files and wait until each is ingested or failed.
    Ingest {
        /// Files or directories. Directories are walked recursively and
        /// only supported document types are taken.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Owner recorded on every uploaded document.
        #[arg(long, default_value = "cli")]
        owner: String,

        /// Document category: audit, policy or financial.
        #[arg(long, default_value = "audit")]
        category: String,

        /// Access group; defaults to GLOBAL_AUDIT.
        #[arg(long)]
        group: Option<String>,
    },

    /// Retry ingestion of a failed document from its stored bytes.
    Reingest { id: String },

    /// Delete a document.
    Delete { id: String },

    /// List documents, newest first.
    List {
        /// Only documents in this state.
        #[arg(long)]
        state: Option<String>,
    },

    /// Show a document as JSON.
    Get { id: String },

    /// Retrieve the chunks most similar to a query.
    Search {
        query: String,

        /// Number of results (defaults to `[retrieval].top_k`).
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum cosine similarity.
        #[arg(long)]
        threshold: Option<f32>,

        #[arg(long)]
        category: Option<String>,

        /// Restrict to these access groups (repeatable).
        #[arg(long = "group")]
        groups: Vec<String>,

        /// Restrict to these documents (repeatable).
        #[arg(long = "document")]
        documents: Vec<String>,

        /// Only documents uploaded on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Words that must all appear in a result (repeatable).
        #[arg(long = "keyword")]
        keywords: Vec<String>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print statistics as JSON.
    Stats,

    /// Print health as JSON. Exits with status 1 when unhealthy.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg, cli.verbose)?;

    let engine = Engine::open(&cfg).await?;

    match cli.command {
        Commands::Init => {
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            paths,
            owner,
            category,
            group,
        } => {
            let category = Category::from_str(&category)?;
            run_ingest(&engine, &paths, &owner, category, group).await?;
        }
        Commands::Reingest { id } => {
            engine.reingest(&id).await?;
            let state = engine.wait(&id).await?;
            print_outcome(&engine, &id, state).await?;
        }
        Commands::Delete { id } => {
            engine.delete(&id).await?;
            println!("Deleted {id}");
        }
        Commands::List { state } => {
            let state = state.as_deref().map(DocumentState::from_str).transpose()?;
            let docs = engine.list(state).await;
            if docs.is_empty() {
                println!("No documents.");
            }
            for doc in docs {
                println!(
                    "{}  {:<10}  {:>5} chunks  {}/{}",
                    doc.id, doc.state, doc.chunk_count, doc.owner, doc.filename
                );
            }
        }
        Commands::Get { id } => {
            let doc = engine.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Search {
            query,
            limit,
            threshold,
            category,
            groups,
            documents,
            since,
            keywords,
            json,
        } => {
            let filters = SearchFilters {
                document_ids: (!documents.is_empty()).then_some(documents),
                uploaded_after: since.as_deref().map(parse_date).transpose()?,
                access_groups: (!groups.is_empty()).then_some(groups),
                category: category.as_deref().map(Category::from_str).transpose()?,
            };
            let query = Query {
                text: query,
                top_k: limit,
                similarity_threshold: threshold,
                filters,
                keywords,
            };
            let results = engine.retrieve(&query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in results.iter().enumerate() {
                    let location = hit.location.as_deref().unwrap_or("-");
                    println!(
                        "{}. [{:.3}] {} ({}) #{}",
                        i + 1,
                        hit.score,
                        hit.filename,
                        location,
                        hit.sequence
                    );
                    println!("   {}", snippet(&hit.text, 200));
                }
            }
        }
        Commands::Stats => {
            let stats = engine.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Health => {
            engine.purge_orphans().await;
            let health = engine.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if !health.healthy {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn init_tracing(cfg: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        Level::from_str(&cfg.log.level)
            .with_context(|| format!("Invalid log level: {}", cfg.log.level))?
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

async fn run_ingest(
    engine: &Engine,
    paths: &[PathBuf],
    owner: &str,
    category: Category,
    group: Option<String>,
) -> Result<()> {
    let files = collect_files(paths)?;
    if files.is_empty() {
        bail!("No supported documents found");
    }
    info!(files = files.len(), "uploading");

    let mut submitted = Vec::with_capacity(files.len());
    for path in &files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let request = UploadRequest {
            bytes,
            filename,
            owner: owner.to_string(),
            mime: None,
            category,
            access_group: group.clone(),
        };
        match engine.upload(request.clone()).await {
            Ok(receipt) => submitted.push(receipt.document_id),
            Err(audit_intel::Error::Overloaded(_)) => {
                // Drain what is queued, then retry once.
                for id in submitted.drain(..) {
                    let state = engine.wait(&id).await?;
                    print_outcome(engine, &id, state).await?;
                }
                submitted.push(engine.upload(request).await?.document_id);
            }
            Err(err) => {
                println!("{}: {err}", path.display());
            }
        }
    }

    for id in submitted {
        let state = engine.wait(&id).await?;
        print_outcome(engine, &id, state).await?;
    }
    Ok(())
}

async fn print_outcome(engine: &Engine, id: &str, state: DocumentState) -> Result<()> {
    let doc = engine.get(id).await?;
    match (&doc.failure, state) {
        (Some(failure), DocumentState::Failed) => println!(
            "{}  {:<10}  {}  [{}] {}",
            id,
            state,
            doc.filename,
            failure.kind.as_str(),
            failure.message
        ),
        _ => println!(
            "{}  {:<10}  {}  ({} chunks)",
            id, state, doc.filename, doc.chunk_count
        ),
    }
    Ok(())
}

fn parse_date(s: &str) -> Result<i64> {
    let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{s}', expected YYYY-MM-DD"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("Invalid date")?
        .and_utc();
    Ok(midnight.timestamp_millis())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{cut}…")
}
