//! # docindex CLI (`dix`)
//!
//! The `dix` binary builds, queries, verifies and repairs per-document
//! vector indexes.
//!
//! ## Usage
//!
//! ```bash
//! dix --config ./config/docindex.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dix init` | Create the storage directories and the metadata database |
//! | `dix build <file>` | Register a document and build its index |
//! | `dix query <id> "<question>"` | Answer a question from one document's index |
//! | `dix documents` | List registered documents |
//! | `dix status [<id>]` | Show one index, or all of them |
//! | `dix verify <id>` | Grade an index for corruption without changing it |
//! | `dix rebuild <id>` | Rebuild an index from the document's current content |
//! | `dix recover <id>` | Repair or rebuild an index as its damage requires |
//! | `dix cleanup` | Remove orphaned index rows and directories |
//! | `dix health` | Run health probes and a corruption sweep |
//! | `dix stats` | Print storage, cache, recovery and circuit statistics |
//!
//! ## Exit status
//!
//! `0` on success. `1` when the command fails, when `verify` finds a
//! corrupted index, or when `health` reports a critical system.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use docindex::config;
use docindex::coordinator::{self, Coordinator};
use docindex::error::IndexError;
use docindex::logging::{self, Verbosity};
use docindex::migrate;
use docindex::recovery::HealthStatus;
use docindex::stats;

/// docindex CLI: per-document vector indexes for question answering.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docindex.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dix",
    about = "Build, query, verify and repair per-document vector indexes",
    version,
    long_about = "docindex keeps one vector index per document on disk, loads them into a \
    bounded cache on demand, answers questions from them, and grades and repairs indexes whose \
    files have gone missing or drifted from the metadata store."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docindex.toml")]
    config: PathBuf,

    /// Debug logging on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors only on stderr.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the storage root, the temp directory and the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Register a document and build its index.
    ///
    /// Supported formats: plain text, Markdown, PDF and DOCX. Fails when an
    /// index for the same content already exists unless `--overwrite` is
    /// given.
    Build {
        /// Path to the document file.
        file: PathBuf,

        /// Replace an existing index for the same content.
        #[arg(long)]
        overwrite: bool,
    },

    /// Answer a question from one document's index.
    Query {
        /// Document ID (see `dix documents`).
        id: i64,

        /// The question to answer.
        question: String,
    },

    /// List registered documents.
    Documents,

    /// Show index status for one document, or a table of all indexes.
    Status {
        /// Document ID. Omit to list every index.
        id: Option<i64>,
    },

    /// Grade a document's index for corruption without changing it.
    Verify {
        /// Document ID.
        id: i64,
    },

    /// Rebuild a document's index from its current content.
    Rebuild {
        /// Document ID.
        id: i64,
    },

    /// Repair or rebuild a document's index as its damage requires.
    Recover {
        /// Document ID.
        id: i64,

        /// Rebuild even when a lighter repair would do.
        #[arg(long)]
        force: bool,
    },

    /// Remove index rows whose document is gone and directories no row references.
    Cleanup,

    /// Run health probes and a corruption sweep.
    Health,

    /// Print storage, cache, recovery and circuit statistics.
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.quiet));

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            if let Some(index_err) = err.downcast_ref::<IndexError>() {
                for rec in index_err.recommendations() {
                    eprintln!("  hint: {}", rec);
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = config::load_config(&cli.config)?;
    let json = cli.json;

    if let Commands::Init = cli.command {
        for dir in coordinator::storage_dirs(&cfg) {
            std::fs::create_dir_all(&dir)?;
            tracing::debug!(path = %dir.display(), "storage directory ready");
        }
        migrate::run_migrations(&cfg).await?;
        println!("Storage and database initialized successfully.");
        return Ok(ExitCode::SUCCESS);
    }

    let coord = Coordinator::open(&cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Build { file, overwrite } => {
            let record = coord.index_file(&file, overwrite).await?;
            if json {
                print_json(&record)?;
            } else {
                println!(
                    "Built index for document {} ({} chunks)",
                    record.document_id, record.chunk_count
                );
                println!("  {}", record.index_path.display());
            }
        }
        Commands::Query { id, question } => {
            let answer = coord.query(id, &question).await?;
            if json {
                print_json(&answer)?;
            } else {
                println!("{}", answer.answer);
            }
        }
        Commands::Documents => {
            let docs = coord.list_documents().await?;
            if json {
                print_json(&docs)?;
            } else if docs.is_empty() {
                println!("No documents registered.");
            } else {
                println!("  {:>6} {:<28} {:>10}   {}", "ID", "TITLE", "SIZE", "PATH");
                println!("  {}", "-".repeat(80));
                for d in &docs {
                    println!(
                        "  {:>6} {:<28} {:>10}   {}",
                        d.id,
                        d.title,
                        docindex::file_manager::format_bytes(d.file_size),
                        d.file_path.display()
                    );
                }
            }
        }
        Commands::Status { id: Some(id) } => {
            let status = coord.index_status(id).await?;
            if json {
                print_json(&status)?;
            } else {
                stats::print_index_status(&status);
            }
        }
        Commands::Status { id: None } => {
            let indexes = coord.list_indexes().await?;
            if json {
                print_json(&indexes)?;
            } else {
                stats::print_index_table(&indexes);
            }
        }
        Commands::Verify { id } => {
            let report = coord.verify(id).await?;
            if json {
                print_json(&report)?;
            } else {
                println!("Document {}: {}", id, report.severity);
                for file in &report.missing_files {
                    println!("  missing:   {}", file);
                }
                for file in &report.empty_files {
                    println!("  empty:     {}", file);
                }
                for file in &report.corrupted_files {
                    println!("  corrupted: {}", file);
                }
                for note in &report.drift {
                    println!("  drift:     {}", note);
                }
                for rec in &report.recommendations {
                    println!("  hint: {}", rec);
                }
            }
            if report.is_corrupted() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Rebuild { id } => {
            let record = coord.rebuild_index(id).await?;
            if json {
                print_json(&record)?;
            } else {
                println!(
                    "Rebuilt index for document {} ({} chunks)",
                    record.document_id, record.chunk_count
                );
            }
        }
        Commands::Recover { id, force } => {
            let result = coord.recover(id, force).await?;
            if json {
                print_json(&result)?;
            } else {
                println!(
                    "Document {}: {} -> {} ({})",
                    id,
                    result.severity_before,
                    result.severity_after,
                    result.action.as_str()
                );
                println!("  {}", result.message);
            }
            if !result.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Cleanup => {
            let removed = coord.cleanup_orphans().await?;
            if json {
                print_json(&serde_json::json!({ "removed": removed }))?;
            } else {
                println!("Removed {} orphan(s).", removed);
            }
        }
        Commands::Health => {
            let report = coord.health_check().await?;
            if json {
                print_json(&report)?;
            } else {
                println!("Status: {}", report.status.as_str());
                for (name, ok) in &report.checks {
                    println!("  {:<24} {}", name, if *ok { "ok" } else { "FAIL" });
                }
                for c in &report.corrupted {
                    println!(
                        "  corrupted: document {} ({}) {}",
                        c.document_id,
                        c.severity,
                        c.path.display()
                    );
                }
                if report.orphans_removed > 0 {
                    println!("  orphans removed: {}", report.orphans_removed);
                }
                for rec in &report.recommendations {
                    println!("  hint: {}", rec);
                }
            }
            if report.status == HealthStatus::Critical {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Stats => {
            let snapshot = coord.get_stats().await?;
            if json {
                print_json(&snapshot)?;
            } else {
                stats::print_stats(&snapshot);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
